//! Planner role: proposes the next batch of actions

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use veer_context::{AgentRole, RoleView};
use veer_core::{ActionPlan, EnvironmentSnapshot, Result};

use crate::guard::GuardedOracle;
use crate::oracle::OracleRequest;
use crate::prompt::{planning_prompt, PLANNER_SYSTEM};
use crate::schema::{parse_reply, PlanningResponse};

pub struct Planner {
    oracle: GuardedOracle,
    max_actions: usize,
    max_elements: usize,
}

impl Planner {
    pub fn new(oracle: GuardedOracle) -> Self {
        Self {
            oracle,
            max_actions: 10,
            max_elements: 40,
        }
    }

    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions.max(1);
        self
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Produce a validated plan whose indices refer to `snapshot`.
    ///
    /// Plans longer than the per-step cap are truncated.
    #[instrument(skip(self, goal, view, snapshot, cancel), fields(generation = snapshot.generation))]
    pub async fn plan(
        &self,
        goal: &str,
        view: &RoleView,
        snapshot: &EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<ActionPlan> {
        let prompt = planning_prompt(view, snapshot, self.max_actions, self.max_elements);
        let request = OracleRequest::new(AgentRole::Planner, PLANNER_SYSTEM, prompt);
        let reply = self.oracle.invoke(&request, cancel).await?;

        let mut response: PlanningResponse = parse_reply(&reply.text)?;
        response.validate(snapshot)?;
        response.actions.truncate(self.max_actions);
        debug!(actions = response.actions.len(), mode = %response.execution_mode, "planned");

        Ok(ActionPlan::new(goal, response.actions, response.execution_mode).with_basis(snapshot.generation))
    }
}
