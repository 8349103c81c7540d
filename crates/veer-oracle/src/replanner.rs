//! Replanning protocol
//!
//! Packages the goal, progress, interruption reason and a fresh snapshot into
//! an oracle request and validates the structured answer. The replanner never
//! guesses. A reply that fails validation keeps the original remaining
//! actions; an empty reply is [`ReplanOutcome::Unusable`] and the caller
//! decides what to do.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use veer_context::AgentRole;
use veer_core::{Action, ActionRecord, EnvironmentSnapshot, ExecutionMode, Result, VeerError};

use crate::guard::GuardedOracle;
use crate::oracle::OracleRequest;
use crate::prompt::{replanning_prompt, ReplanPrompt, REPLANNER_SYSTEM};
use crate::schema::{parse_reply, ReplanningResponse};

/// Input to one replanning round
#[derive(Debug, Clone)]
pub struct ReplanRequest<'a> {
    pub goal: &'a str,
    pub reason: &'a str,
    pub remaining: &'a [Action],
    pub snapshot: &'a EnvironmentSnapshot,
    pub completed: &'a [ActionRecord],
    /// Navigator notes (sequence-break reasons, obstruction outcomes)
    pub notes: &'a [String],
}

/// What the oracle decided about the remaining actions
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanOutcome {
    /// Replace the remaining actions with these
    Updated {
        actions: Vec<Action>,
        mode: ExecutionMode,
        analysis: String,
        reasoning: String,
    },
    /// Keep the remaining actions as they are
    Unchanged { analysis: String },
    /// Reply was malformed or failed validation; remaining actions are kept
    Rejected { reason: String },
    /// No answer at all; cannot be fixed automatically
    Unusable { reason: String },
}

impl ReplanOutcome {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Unusable { .. })
    }
}

pub struct Replanner {
    oracle: GuardedOracle,
    max_elements: usize,
}

impl Replanner {
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

    /// Ask the oracle to repair the remaining actions.
    ///
    /// Transport failures that outlive the retry budget, timeouts and
    /// cancellation surface as errors. A reply that fails parsing or
    /// validation is `Rejected`, which means proceeding with the original
    /// plan. A blank reply is `Unusable`.
    #[instrument(skip(self, request, cancel), fields(remaining = request.remaining.len()))]
    pub async fn replan(&self, request: ReplanRequest<'_>, cancel: &CancellationToken) -> Result<ReplanOutcome> {
        let prompt = replanning_prompt(&ReplanPrompt {
            goal: request.goal,
            reason: request.reason,
            completed: request.completed,
            remaining: request.remaining,
            snapshot: request.snapshot,
            notes: request.notes,
            max_elements: self.max_elements,
        });
        let oracle_request = OracleRequest::new(AgentRole::Planner, REPLANNER_SYSTEM, prompt);

        let reply = match self.oracle.invoke(&oracle_request, cancel).await {
            Ok(reply) => reply,
            Err(VeerError::OracleMalformed(reason)) => return Ok(rejected(reason)),
            Err(e) => return Err(e),
        };
        if reply.text.trim().is_empty() {
            warn!("replanner returned an empty reply");
            return Ok(ReplanOutcome::Unusable {
                reason: "oracle returned no replanning response".to_string(),
            });
        }

        let response: ReplanningResponse = match parse_reply(&reply.text) {
            Ok(response) => response,
            Err(e) => return Ok(rejected(e.to_string())),
        };
        if let Err(e) = response.validate(request.snapshot) {
            return Ok(rejected(e.to_string()));
        }

        let outcome = if response.needs_replanning {
            ReplanOutcome::Updated {
                actions: response.updated_plan,
                mode: response.execution_mode,
                analysis: response.analysis,
                reasoning: response.reasoning,
            }
        } else {
            ReplanOutcome::Unchanged {
                analysis: response.analysis,
            }
        };
        info!(usable = outcome.is_usable(), "replanning finished");
        Ok(outcome)
    }
}

fn rejected(reason: String) -> ReplanOutcome {
    warn!(error = %reason, "replanner reply rejected, keeping the original plan");
    ReplanOutcome::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedOracle;
    use std::sync::Arc;
    use std::time::Duration;
    use veer_core::fail_open::RetryPolicy;
    use veer_core::{ElementNode, SessionId};

    fn snapshot() -> EnvironmentSnapshot {
        EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://mail.example/compose",
            vec![
                ElementNode::new(0, "input").with_attr("aria-label", "To"),
                ElementNode::new(1, "li").with_role("option").with_text("bob@example.com"),
                ElementNode::new(2, "input").with_attr("aria-label", "Subject"),
            ],
        )
    }

    fn replanner(oracle: ScriptedOracle) -> Replanner {
        let guard = GuardedOracle::new(
            Arc::new(oracle),
            Duration::from_secs(1),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        );
        Replanner::new(guard)
    }

    async fn run(oracle: ScriptedOracle) -> Result<ReplanOutcome> {
        run_with(replanner(oracle)).await
    }

    async fn run_with(replanner: Replanner) -> Result<ReplanOutcome> {
        let remaining = vec![Action::InputText {
            index: 1,
            text: "Hello".to_string(),
        }];
        let snapshot = snapshot();
        replanner
            .replan(
                ReplanRequest {
                    goal: "send mail to bob",
                    reason: "suggestion list appeared under element 0",
                    remaining: &remaining,
                    snapshot: &snapshot,
                    completed: &[],
                    notes: &[],
                },
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_updated_plan_is_spliced_in() {
        let oracle = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": true, "analysis": "pick suggestion", "executionMode": "single_step",
                "updatedPlan": [{"type": "click", "index": 1}, {"type": "input_text", "index": 2, "text": "Hello"}],
                "reasoning": "select bob first"}"#,
        );
        match run(oracle).await.unwrap() {
            ReplanOutcome::Updated { actions, mode, .. } => {
                assert_eq!(actions.len(), 2);
                assert_eq!(actions[0], Action::Click { index: 1 });
                assert_eq!(mode, ExecutionMode::SingleStep);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_replanning_needed_keeps_original() {
        let oracle = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": false, "analysis": "still valid", "executionMode": "batch",
                "updatedPlan": [], "reasoning": ""}"#,
        );
        assert_eq!(
            run(oracle).await.unwrap(),
            ReplanOutcome::Unchanged {
                analysis: "still valid".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_reply_is_rejected() {
        let oracle = ScriptedOracle::new().reply(AgentRole::Planner, "I think you should click bob");
        assert!(matches!(run(oracle).await.unwrap(), ReplanOutcome::Rejected { .. }));

        let stale = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": true, "analysis": "", "executionMode": "batch",
                "updatedPlan": [{"type": "click", "index": 42}], "reasoning": ""}"#,
        );
        assert!(matches!(run(stale).await.unwrap(), ReplanOutcome::Rejected { .. }));

        let empty = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": true, "analysis": "", "executionMode": "batch",
                "updatedPlan": [], "reasoning": ""}"#,
        );
        let outcome = run(empty).await.unwrap();
        assert!(outcome.is_usable());
        assert!(matches!(outcome, ReplanOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_blank_reply_is_unusable() {
        let oracle = ScriptedOracle::new().reply(AgentRole::Planner, "   ");
        assert!(!run(oracle).await.unwrap().is_usable());
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let oracle = ScriptedOracle::new()
            .fail(AgentRole::Planner, "503")
            .fail(AgentRole::Planner, "503");
        let err = run(oracle).await.unwrap_err();
        assert!(err.is_oracle());
    }

    #[tokio::test]
    async fn test_prompt_respects_element_limit() {
        let oracle = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": false, "analysis": "ok", "executionMode": "batch", "updatedPlan": [], "reasoning": ""}"#,
        );
        run_with(replanner(oracle.clone()).with_max_elements(1)).await.unwrap();

        let prompts = oracle.prompts_for(AgentRole::Planner);
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].prompt.contains("(1 of 3 elements shown)"));
    }
}
