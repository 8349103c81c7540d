//! Per-session snapshot cache
//!
//! Validity is decided by a per-session generation counter, never by
//! inspecting the cached snapshot itself. `invalidate` only bumps the
//! counter, so it is idempotent and can race with a reader without tearing:
//! a reader either sees the old generation (and the entry it was stored
//! with) or the new one (and a miss).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use veer_core::config::CacheSettings;
use veer_core::{EnvironmentSnapshot, Result, SessionId};

use crate::driver::{EnvironmentDriver, MutationSignal};

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: Arc<EnvironmentSnapshot>,
    generation: u64,
    cached_at: Instant,
}

/// Memoizes the last snapshot per session
#[derive(Debug)]
pub struct EnvironmentCache {
    ttl: Duration,
    entries: RwLock<HashMap<SessionId, CacheEntry>>,
    generations: Mutex<HashMap<SessionId, Arc<AtomicU64>>>,
}

impl EnvironmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn counter(&self, session: &SessionId) -> Arc<AtomicU64> {
        let mut generations = match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generations
            .entry(session.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Current generation for a session
    pub fn generation(&self, session: &SessionId) -> u64 {
        self.counter(session).load(Ordering::Acquire)
    }

    /// Whether nothing has invalidated the session since `generation` was observed
    pub fn is_current(&self, session: &SessionId, generation: u64) -> bool {
        self.generation(session) == generation
    }

    /// Cached snapshot, only if younger than the TTL and not invalidated since caching
    pub async fn get(&self, session: &SessionId) -> Option<Arc<EnvironmentSnapshot>> {
        let current = self.generation(session);
        let entries = self.entries.read().await;
        let entry = entries.get(session)?;

        if entry.generation != current {
            debug!(session = %session, cached = entry.generation, current, "cache miss: invalidated");
            return None;
        }
        if entry.cached_at.elapsed() >= self.ttl {
            debug!(session = %session, "cache miss: expired");
            return None;
        }
        Some(entry.snapshot.clone())
    }

    /// Store a snapshot built while `ticket` was the current generation.
    ///
    /// Returns `false` (and stores nothing) when the session was invalidated
    /// while the snapshot was being built.
    pub async fn put(&self, session: &SessionId, mut snapshot: EnvironmentSnapshot, ticket: u64) -> bool {
        snapshot.generation = ticket;
        self.store(session, Arc::new(snapshot), ticket).await
    }

    async fn store(&self, session: &SessionId, snapshot: Arc<EnvironmentSnapshot>, ticket: u64) -> bool {
        if !self.is_current(session, ticket) {
            debug!(session = %session, ticket, "discarding snapshot built across an invalidation");
            return false;
        }
        self.entries.write().await.insert(
            session.clone(),
            CacheEntry {
                snapshot,
                generation: ticket,
                cached_at: Instant::now(),
            },
        );
        true
    }

    /// Mark the cached snapshot of a session invalid
    pub fn invalidate(&self, session: &SessionId) {
        let previous = self.counter(session).fetch_add(1, Ordering::AcqRel);
        debug!(session = %session, generation = previous + 1, "cache invalidated");
    }

    /// Build a snapshot through the driver, bypassing any cached entry
    #[instrument(skip(self, driver))]
    pub async fn fresh(
        &self,
        session: &SessionId,
        driver: &dyn EnvironmentDriver,
    ) -> Result<Arc<EnvironmentSnapshot>> {
        let ticket = self.generation(session);
        let mut snapshot = driver.snapshot(session).await?;
        snapshot.generation = ticket;
        let snapshot = Arc::new(snapshot);
        // Not stored when invalidated mid-build; its generation still tells the caller it is stale.
        self.store(session, snapshot.clone(), ticket).await;
        Ok(snapshot)
    }

    /// Cached snapshot if valid, otherwise a fresh one
    pub async fn get_or_fetch(
        &self,
        session: &SessionId,
        driver: &dyn EnvironmentDriver,
    ) -> Result<Arc<EnvironmentSnapshot>> {
        match self.get(session).await {
            Some(snapshot) => Ok(snapshot),
            None => self.fresh(session, driver).await,
        }
    }

    /// Age of the cached entry, whatever its validity
    pub async fn age(&self, session: &SessionId) -> Option<Duration> {
        self.entries
            .read()
            .await
            .get(session)
            .map(|e| e.cached_at.elapsed())
    }

    /// Drop everything held for a session
    pub async fn remove(&self, session: &SessionId) {
        self.entries.write().await.remove(session);
        let mut generations = match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generations.remove(session);
    }

    /// Remove expired entries by timestamp; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn invalidate_all(&self) {
        let counters: Vec<Arc<AtomicU64>> = match self.generations.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for counter in counters {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Invalidate sessions as the driver reports mutations.
    ///
    /// If the listener falls behind the channel, every session is invalidated,
    /// since the missed signals cannot be attributed.
    pub fn spawn_invalidation_listener(
        self: Arc<Self>,
        mut signals: broadcast::Receiver<MutationSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = signals.recv() => match received {
                        Ok(signal) => self.invalidate(&signal.session_id),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "mutation listener lagged, invalidating all sessions");
                            self.invalidate_all();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Periodically drop expired entries until cancelled
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            debug!(removed, "swept expired snapshots");
                        }
                    }
                }
            }
        })
    }
}
