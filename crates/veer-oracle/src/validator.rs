//! Validator role: confirms a claimed completion

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use veer_context::{AgentRole, RoleView};
use veer_core::{EnvironmentSnapshot, Result};

use crate::guard::GuardedOracle;
use crate::oracle::OracleRequest;
use crate::prompt::{validation_prompt, VALIDATOR_SYSTEM};
use crate::schema::{parse_reply, ValidationVerdict};

pub struct Validator {
    oracle: GuardedOracle,
    max_elements: usize,
}

impl Validator {
    pub fn new(oracle: GuardedOracle) -> Self {
        Self {
            oracle,
            max_elements: 40,
        }
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    #[instrument(skip(self, view, claim, snapshot, cancel))]
    pub async fn validate(
        &self,
        view: &RoleView,
        claim: &str,
        snapshot: &EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<ValidationVerdict> {
        let prompt = validation_prompt(view, claim, snapshot, self.max_elements);
        let request = OracleRequest::new(AgentRole::Validator, VALIDATOR_SYSTEM, prompt);
        let reply = self.oracle.invoke(&request, cancel).await?;
        let verdict: ValidationVerdict = parse_reply(&reply.text)?;
        info!(complete = verdict.is_complete, reason = %verdict.reason, "validated completion");
        Ok(verdict)
    }
}
