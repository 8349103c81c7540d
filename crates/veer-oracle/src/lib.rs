//! # veer-oracle
//!
//! The decision oracle and the roles built on it.
//!
//! Every call goes through [`GuardedOracle`], which adds a timeout, cooperative
//! cancellation and bounded retry. Replies are parsed into fixed shapes and
//! validated against the snapshot before anything acts on them.

mod anthropic;
mod auth;
mod circuit_breaker;
mod guard;
mod oracle;
mod planner;
pub mod prompt;
mod replanner;
pub mod schema;
mod scripted;
mod validator;

pub use anthropic::AnthropicOracle;
pub use auth::api_key;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use guard::GuardedOracle;
pub use oracle::{DecisionOracle, OracleReply, OracleRequest, Usage};
pub use planner::Planner;
pub use replanner::{ReplanOutcome, ReplanRequest, Replanner};
pub use schema::{PlanningResponse, ReplanningResponse, ValidationVerdict};
pub use scripted::{ScriptedOracle, ScriptedReply};
pub use validator::Validator;
