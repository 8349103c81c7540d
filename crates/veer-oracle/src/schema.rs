//! Structured oracle responses and their validation
//!
//! Oracle text is never trusted: the JSON object is pulled out of the reply,
//! checked against a fixed shape, and every index-targeting action must point
//! at an addressable element of the snapshot it was planned against.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use veer_core::{Action, EnvironmentSnapshot, ExecutionMode, Result, VeerError};

/// Reply shape expected from the planner role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningResponse {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub reasoning: String,
}

/// Reply shape expected from the replanner; every field is required
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplanningResponse {
    pub needs_replanning: bool,
    pub analysis: String,
    pub execution_mode: ExecutionMode,
    pub updated_plan: Vec<Action>,
    pub reasoning: String,
}

/// Reply shape expected from the validator role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub is_complete: bool,
    #[serde(default)]
    pub reason: String,
}

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("fence pattern is valid"))
}

/// Locate the JSON object in free-form oracle text
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(captures) = fenced_block().captures(text) {
        return captures.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse `text` into `T`, mapping every failure to [`VeerError::OracleMalformed`]
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json(text).ok_or_else(|| VeerError::OracleMalformed("no JSON object in reply".to_string()))?;
    serde_json::from_str(json).map_err(|e| VeerError::OracleMalformed(e.to_string()))
}

/// Reject actions whose index is not addressable in `snapshot`
pub fn validate_actions(actions: &[Action], snapshot: &EnvironmentSnapshot) -> Result<()> {
    for action in actions {
        if let Some(index) = action.target_index() {
            let addressable = snapshot
                .element(index)
                .is_some_and(|e| e.is_interactive && e.is_visible);
            if !addressable {
                return Err(VeerError::OracleMalformed(format!(
                    "{} targets element {} which is not addressable",
                    action.describe(),
                    index
                )));
            }
        }
        if let Action::Navigate { url } = action {
            if url.trim().is_empty() {
                return Err(VeerError::OracleMalformed("navigate with empty url".to_string()));
            }
        }
    }
    Ok(())
}

impl ReplanningResponse {
    /// Shape and target checks beyond what serde enforces
    pub fn validate(&self, snapshot: &EnvironmentSnapshot) -> Result<()> {
        if self.needs_replanning {
            if self.updated_plan.is_empty() {
                return Err(VeerError::OracleMalformed(
                    "needsReplanning is true but updatedPlan is empty".to_string(),
                ));
            }
            validate_actions(&self.updated_plan, snapshot)?;
        }
        Ok(())
    }
}

impl PlanningResponse {
    pub fn validate(&self, snapshot: &EnvironmentSnapshot) -> Result<()> {
        if self.actions.is_empty() {
            return Err(VeerError::OracleMalformed("plan has no actions".to_string()));
        }
        validate_actions(&self.actions, snapshot)
    }
}
