//! Unified error types for Veer

use thiserror::Error;

/// Unified error type for all Veer operations
#[derive(Error, Debug)]
pub enum VeerError {
    // Environment errors
    #[error("Environment error: {0}")]
    Environment(String),

    // Oracle errors
    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Oracle timed out after {0} ms")]
    OracleTimeout(u64),

    #[error("Oracle returned a malformed response: {0}")]
    OracleMalformed(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    // Action errors
    #[error("Action failed on element {index:?}: {message}")]
    ActionExecution {
        index: Option<usize>,
        message: String,
    },

    #[error("Stale index {index}: {reason}")]
    StaleIndex { index: usize, reason: String },

    #[error("Obstruction unresolved: {0}")]
    ObstructionUnresolved(String),

    // Task lifecycle
    #[error("Task cancelled")]
    TaskCancelled,

    #[error("Maximum consecutive failures exceeded ({failures})")]
    MaxFailuresExceeded { failures: u32 },

    #[error("Maximum steps exceeded ({steps})")]
    MaxStepsExceeded { steps: u32 },

    #[error("Task already live: {0}")]
    TaskAlreadyLive(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    // Configuration
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl VeerError {
    /// Shorthand for an action failure against a specific element
    pub fn action(index: Option<usize>, message: impl Into<String>) -> Self {
        Self::ActionExecution {
            index,
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed (oracle transport problems only)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Oracle(_) | Self::OracleTimeout(_) | Self::ApiLimit(_)
        )
    }

    /// Whether this error means the index was resolved against an outdated snapshot
    pub fn is_stale_index(&self) -> bool {
        matches!(self, Self::StaleIndex { .. })
    }

    /// Whether this is a controlled terminal outcome rather than a failure
    pub fn is_terminal_outcome(&self) -> bool {
        matches!(self, Self::TaskCancelled | Self::MaxStepsExceeded { .. })
    }

    /// Whether this error belongs to the decision oracle
    pub fn is_oracle(&self) -> bool {
        matches!(
            self,
            Self::Oracle(_)
                | Self::OracleTimeout(_)
                | Self::OracleMalformed(_)
                | Self::Auth(_)
                | Self::ApiLimit(_)
        )
    }
}

/// Result type alias using VeerError
pub type Result<T> = std::result::Result<T, VeerError>;
