//! # veer-context
//!
//! Token-bounded shared context for the planner, navigator and validator roles.
//!
//! A [`ContextCoordinator`] keeps one [`SharedContext`] per task. Each update
//! reduces the live snapshot to its most important elements and compresses
//! the action history in two tiers, keeping the most recent messages verbatim.
//! Roles read [`RoleView`] projections of the same context.

pub mod compress;
pub mod coordinator;
pub mod importance;
pub mod model;
pub mod roles;

pub use compress::{compress, CompressionOptions};
pub use coordinator::ContextCoordinator;
pub use model::{
    ActionStat, CompressedEnvironment, CompressedHistory, FailureNote, HistoryMessage, KeyElement, MessageKind,
    SharedContext,
};
pub use roles::{AgentRole, RoleView};
