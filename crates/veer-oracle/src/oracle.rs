//! The decision oracle seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veer_context::AgentRole;
use veer_core::Result;

/// Token usage reported by an oracle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// One prompt for the oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Role the request is made on behalf of
    pub role: AgentRole,
    pub system: String,
    pub prompt: String,
}

impl OracleRequest {
    pub fn new(role: AgentRole, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role,
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

/// Raw text returned by the oracle; callers validate it before use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReply {
    pub text: String,
    pub usage: Option<Usage>,
}

impl OracleReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// External decision maker that proposes and repairs action plans
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleReply>;

    fn name(&self) -> &str {
        "oracle"
    }
}
