//! # veer-engine
//!
//! Drives tasks to completion against a volatile environment.
//!
//! - [`TaskExecutor`]: owns live tasks, one phase per `step`
//! - [`AdaptiveActionRunner`]: executes a plan in batch or single-step mode,
//!   re-resolving indices and breaking the sequence on disruptive changes
//! - [`state_machine`]: the pure lifecycle transition function
//! - [`ActivityLogSink`]: markdown trail of lifecycle events

pub mod activity_logger;
pub mod executor;
pub mod runner;
pub mod state_machine;

pub use activity_logger::ActivityLogSink;
pub use executor::{MemorySummary, TaskExecutor, TaskExecutorBuilder, TaskReport};
pub use runner::{
    AdaptiveActionRunner, LivePlan, ModeDecision, ReplanResolution, RunOutcome, RunReport, RunScope, SequenceBreak,
};
pub use state_machine::{transition, Effect, Event, ResumeTo, State};
