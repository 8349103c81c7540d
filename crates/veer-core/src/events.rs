//! Lifecycle events and the sink abstraction
//!
//! The engine reports state transitions, plan updates and obstruction
//! outcomes to an [`EventSink`]. What consumes them (an activity log, a
//! dashboard, nothing at all) is not the engine's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::analysis::{ChangeKind, ObstructionRecord};
use crate::types::{ActionKind, ExecutionMode, TaskId, TaskStatus};

/// Where a plan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Planner,
    Replanner,
}

impl std::fmt::Display for PlanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Replanner => write!(f, "replanner"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    },
    PlanUpdated {
        task_id: TaskId,
        source: PlanSource,
        actions: usize,
        mode: ExecutionMode,
    },
    ActionExecuted {
        task_id: TaskId,
        step: u32,
        kind: ActionKind,
        success: bool,
    },
    SequenceBreak {
        task_id: TaskId,
        reason: String,
        discarded: usize,
    },
    ObstructionOutcome {
        task_id: TaskId,
        record: ObstructionRecord,
    },
    ObstructionPredicted {
        task_id: TaskId,
        predictions: Vec<(ChangeKind, f64)>,
    },
}

impl LifecycleEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::StateChanged { task_id, .. }
            | Self::PlanUpdated { task_id, .. }
            | Self::ActionExecuted { task_id, .. }
            | Self::SequenceBreak { task_id, .. }
            | Self::ObstructionOutcome { task_id, .. }
            | Self::ObstructionPredicted { task_id, .. } => task_id,
        }
    }

    /// One-line human description
    pub fn summary(&self) -> String {
        match self {
            Self::StateChanged { from, to, reason, .. } => match reason {
                Some(r) => format!("{} -> {} ({})", from, to, r),
                None => format!("{} -> {}", from, to),
            },
            Self::PlanUpdated {
                source,
                actions,
                mode,
                ..
            } => format!("{} produced {} actions ({})", source, actions, mode),
            Self::ActionExecuted {
                step, kind, success, ..
            } => format!(
                "step {}: {} {}",
                step,
                kind,
                if *success { "ok" } else { "failed" }
            ),
            Self::SequenceBreak {
                reason, discarded, ..
            } => format!("sequence break, {} queued actions discarded: {}", discarded, reason),
            Self::ObstructionOutcome { record, .. } => format!(
                "{} obstruction, {} -> {}",
                record.kind,
                record.strategy,
                if record.success { "resolved" } else { "unresolved" }
            ),
            Self::ObstructionPredicted { predictions, .. } => {
                let parts: Vec<String> = predictions
                    .iter()
                    .map(|(kind, p)| format!("{} {:.0}%", kind, p * 100.0))
                    .collect();
                format!("predicted obstructions: {}", parts.join(", "))
            }
        }
    }
}

/// Consumer of lifecycle events
///
/// Implementations must not fail the caller; errors are handled internally.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: LifecycleEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: LifecycleEvent) {}
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: LifecycleEvent) {
        info!(task_id = %event.task_id(), "{}", event.summary());
    }
}

/// Keeps every event in memory, for tests and replays
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(DateTime<Utc>, LifecycleEvent)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        match self.events.lock() {
            Ok(guard) => guard.iter().map(|(_, e)| e.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, e)| e.clone()).collect(),
        }
    }

    /// Status transitions in order of arrival
    pub fn transitions(&self) -> Vec<(TaskStatus, TaskStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::StateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: LifecycleEvent) {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((Utc::now(), event));
    }
}

/// Forwards every event to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn emit(&self, event: LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}
