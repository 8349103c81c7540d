//! Environment driver seam and mutation signalling
//!
//! The driver is the excluded collaborator that builds snapshots and
//! dispatches input events. It announces asynchronous document mutations on
//! a broadcast channel instead of calling back into the cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use veer_core::{Action, ActionResult, EnvironmentSnapshot, Result, SessionId};

/// Capacity of the mutation channel; slow subscribers observe `Lagged`
const MUTATION_CHANNEL_CAPACITY: usize = 256;

/// The live document of a session changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSignal {
    pub session_id: SessionId,
    pub description: String,
    pub at: DateTime<Utc>,
}

impl MutationSignal {
    pub fn new(session_id: SessionId, description: impl Into<String>) -> Self {
        Self {
            session_id,
            description: description.into(),
            at: Utc::now(),
        }
    }
}

/// Publisher side of the mutation channel
#[derive(Debug, Clone)]
pub struct MutationBus {
    tx: broadcast::Sender<MutationSignal>,
}

impl Default for MutationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a signal; having no subscribers is not an error
    pub fn publish(&self, signal: MutationSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationSignal> {
        self.tx.subscribe()
    }
}

/// Driver for one kind of environment (browser, emulator, replay)
#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    /// Build a fresh indexed snapshot of the session's document
    async fn snapshot(&self, session: &SessionId) -> Result<EnvironmentSnapshot>;

    /// Dispatch one action.
    ///
    /// Target failures are reported as an unsuccessful `ActionResult`;
    /// `Err` is reserved for driver-level breakage.
    async fn perform(&self, session: &SessionId, action: &Action) -> Result<ActionResult>;

    async fn wait(&self, _session: &SessionId, ms: u64) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    /// Receive mutation signals for every session this driver serves
    fn subscribe_mutations(&self) -> broadcast::Receiver<MutationSignal>;
}
