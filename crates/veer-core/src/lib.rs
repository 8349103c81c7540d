//! # veer-core
//!
//! Shared vocabulary of the Veer adaptive execution engine.
//!
//! An oracle proposes actions whose element indices are only valid against
//! the snapshot they were planned on. Everything in this crate exists so the
//! other crates can talk about tasks, plans, snapshots and the drift between
//! snapshots with one set of types:
//!
//! - [`Task`], [`ActionPlan`], [`Action`], [`ActionResult`]
//! - [`EnvironmentSnapshot`] and its [`ElementNode`]s
//! - [`ChangeAnalysis`] and [`ObstructionRecord`]
//! - [`VeerError`], [`VeerConfig`], lifecycle events and the [`EventSink`]

pub mod analysis;
pub mod config;
mod error;
pub mod events;
pub mod fail_open;
pub mod snapshot;
pub mod tokens;
mod types;

pub use analysis::{ChangeAnalysis, ChangeKind, ObstructionRecord, ResolutionStrategy};
pub use config::{SettingsProvider, VeerConfig};
pub use error::{Result, VeerError};
pub use events::{EventSink, FanoutSink, LifecycleEvent, NullSink, PlanSource, RecordingSink, TracingSink};
pub use snapshot::{ElementNode, EnvironmentSnapshot, Rect, ScrollInfo};
pub use tokens::TokenEstimator;
pub use types::*;
