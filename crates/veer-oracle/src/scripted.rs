//! Deterministic oracle replaying canned replies per role

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veer_context::AgentRole;
use veer_core::{Result, VeerError};

use crate::oracle::{DecisionOracle, OracleReply, OracleRequest};

/// One canned oracle outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScriptedReply {
    Reply { text: String },
    /// Transport-level failure; retryable
    Fail { message: String },
}

#[derive(Default)]
struct ScriptState {
    queues: HashMap<AgentRole, VecDeque<ScriptedReply>>,
    prompts: Vec<OracleRequest>,
    invocations: usize,
}

/// Queue of replies consumed in order, one queue per role
#[derive(Clone, Default)]
pub struct ScriptedOracle {
    state: Arc<Mutex<ScriptState>>,
    latency: Option<Duration>,
    fallback: Option<String>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, role: AgentRole, text: impl Into<String>) -> Self {
        self.push(role, ScriptedReply::Reply { text: text.into() })
    }

    pub fn fail(self, role: AgentRole, message: impl Into<String>) -> Self {
        self.push(
            role,
            ScriptedReply::Fail {
                message: message.into(),
            },
        )
    }

    pub fn push(self, role: AgentRole, reply: ScriptedReply) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.queues.entry(role).or_default().push_back(reply);
        }
        self
    }

    /// Delay every reply; cancellation tests rely on this
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returned once a role's queue is empty
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn invocations(&self) -> usize {
        self.state.lock().map(|s| s.invocations).unwrap_or(0)
    }

    /// Every request received, in order
    pub fn prompts(&self) -> Vec<OracleRequest> {
        self.state.lock().map(|s| s.prompts.clone()).unwrap_or_default()
    }

    pub fn prompts_for(&self, role: AgentRole) -> Vec<OracleRequest> {
        self.prompts().into_iter().filter(|p| p.role == role).collect()
    }

    pub fn remaining(&self, role: AgentRole) -> usize {
        self.state
            .lock()
            .map(|s| s.queues.get(&role).map(VecDeque::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleReply> {
        let next = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| VeerError::Other("scripted oracle lock poisoned".to_string()))?;
            state.invocations += 1;
            state.prompts.push(request.clone());
            state.queues.get_mut(&request.role).and_then(VecDeque::pop_front)
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match next {
            Some(ScriptedReply::Reply { text }) => Ok(OracleReply::text(text)),
            Some(ScriptedReply::Fail { message }) => Err(VeerError::Oracle(message)),
            None => match &self.fallback {
                Some(text) => Ok(OracleReply::text(text.clone())),
                None => Err(VeerError::OracleMalformed(format!(
                    "no scripted reply left for {}",
                    request.role
                ))),
            },
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_are_per_role_and_in_order() {
        let oracle = ScriptedOracle::new()
            .reply(AgentRole::Planner, "p1")
            .reply(AgentRole::Validator, "v1")
            .reply(AgentRole::Planner, "p2");

        let planner = OracleRequest::new(AgentRole::Planner, "", "plan");
        let validator = OracleRequest::new(AgentRole::Validator, "", "check");

        assert_eq!(oracle.invoke(&planner).await.unwrap().text, "p1");
        assert_eq!(oracle.invoke(&validator).await.unwrap().text, "v1");
        assert_eq!(oracle.invoke(&planner).await.unwrap().text, "p2");
        assert!(oracle.invoke(&planner).await.is_err());

        assert_eq!(oracle.invocations(), 4);
        assert_eq!(oracle.prompts_for(AgentRole::Validator).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_is_retryable() {
        let oracle = ScriptedOracle::new().fail(AgentRole::Navigator, "503");
        let err = oracle
            .invoke(&OracleRequest::new(AgentRole::Navigator, "", ""))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
