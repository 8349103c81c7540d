//! One compressed [`SharedContext`] per task, shared by all agent roles
//!
//! Contexts are handed out as `Arc`s. Updates clone-on-write through
//! [`Arc::make_mut`], so a role holding an older `Arc` keeps a consistent
//! view while the coordinator publishes the next version. Idle eviction only
//! compares timestamps and drops the coordinator's reference. Pinned contexts
//! (those of paused tasks) are never evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use veer_core::config::ContextSettings;
use veer_core::{ActionKind, ActionRecord, EnvironmentSnapshot, TaskId, TokenEstimator};

use crate::compress::{compress, total_tokens, CompressionOptions};
use crate::importance::compress_environment;
use crate::model::{ActionStat, CompressedHistory, FailureNote, HistoryMessage, SharedContext};
use crate::roles::{AgentRole, RoleView};

/// Scratch notes kept per role; older notes fall off the front
const SCRATCH_LIMIT: usize = 10;

struct Slot {
    context: Arc<SharedContext>,
    last_access: Instant,
    pinned: bool,
}

/// Maintains the shared context of every live task
pub struct ContextCoordinator {
    settings: ContextSettings,
    slots: RwLock<HashMap<TaskId, Slot>>,
}

impl ContextCoordinator {
    pub fn new(settings: ContextSettings) -> Self {
        Self {
            settings,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Recompress the task's context from the live environment and history.
    ///
    /// Creates the context on first use. Scratch notes survive updates.
    #[instrument(skip(self, goal, snapshot, records), fields(records = records.len()))]
    pub async fn get_or_update(
        &self,
        task_id: &TaskId,
        goal: &str,
        snapshot: &EnvironmentSnapshot,
        records: &[ActionRecord],
    ) -> Arc<SharedContext> {
        let environment = compress_environment(snapshot, self.settings.max_key_elements);

        let mut slots = self.slots.write().await;
        let slot = slots.entry(task_id.clone()).or_insert_with(|| Slot {
            context: Arc::new(SharedContext::new(task_id.clone(), goal)),
            last_access: Instant::now(),
            pinned: false,
        });
        slot.last_access = Instant::now();

        let context = Arc::make_mut(&mut slot.context);
        let scratch_tokens: usize = context
            .scratch
            .values()
            .flatten()
            .map(|s| TokenEstimator::estimate(s))
            .sum();

        let mut history = CompressedHistory {
            messages: Vec::new(),
            patterns: patterns(records),
            failures: failure_tail(records, self.settings.failure_tail),
            total_actions: records.len(),
        };
        let messages: Vec<HistoryMessage> = records.iter().filter_map(HistoryMessage::from_record).collect();

        let reserved = environment.tokens() + history.aux_tokens() + scratch_tokens;
        let budget = self.settings.token_budget.saturating_sub(reserved);
        let options = CompressionOptions::new(budget, self.settings.preserve_recent)
            .with_chunk_size(self.settings.chunk_size);
        let before = total_tokens(&messages);
        history.messages = compress(&messages, options);
        let compressed = total_tokens(&history.messages) < before;

        let now = Utc::now();
        context.goal = goal.to_string();
        context.environment = environment;
        context.history = history;
        context.compressed = compressed;
        context.updated_at = now;
        context.last_access = now;
        context.access_count += 1;
        context.version += 1;

        debug!(
            version = context.version,
            compressed,
            tokens = context.estimated_tokens(),
            "updated shared context"
        );
        Arc::clone(&slot.context)
    }

    /// Current context without recompressing
    pub async fn get(&self, task_id: &TaskId) -> Option<Arc<SharedContext>> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(task_id)?;
        slot.last_access = Instant::now();
        Some(Arc::clone(&slot.context))
    }

    /// Role-specific rendering of the task's context
    pub async fn project(&self, task_id: &TaskId, role: AgentRole) -> Option<RoleView> {
        let context = self.get(task_id).await?;
        Some(RoleView::project(&context, role))
    }

    /// Append a scratch note for `role`. Returns false when the task has no context yet.
    pub async fn note(&self, task_id: &TaskId, role: AgentRole, text: impl Into<String>) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(task_id) else {
            return false;
        };
        slot.last_access = Instant::now();

        let context = Arc::make_mut(&mut slot.context);
        let notes = context.scratch.entry(role).or_default();
        notes.push(text.into());
        if notes.len() > SCRATCH_LIMIT {
            let excess = notes.len() - SCRATCH_LIMIT;
            notes.drain(..excess);
        }
        context.updated_at = Utc::now();
        context.version += 1;
        true
    }

    /// Drop contexts untouched for longer than the idle TTL
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.settings.idle_ttl();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| slot.pinned || slot.last_access.elapsed() < ttl);
        before - slots.len()
    }

    /// Exempt the task's context from idle eviction until [`Self::unpin`].
    /// Returns false when the task has no context yet.
    pub async fn pin(&self, task_id: &TaskId) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(task_id) else {
            return false;
        };
        slot.pinned = true;
        true
    }

    /// Make the context evictable again; the idle clock restarts now
    pub async fn unpin(&self, task_id: &TaskId) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(task_id) else {
            return false;
        };
        slot.pinned = false;
        slot.last_access = Instant::now();
        true
    }

    pub async fn remove(&self, task_id: &TaskId) -> bool {
        self.slots.write().await.remove(task_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // interval() rejects a zero period
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle().await;
                        if evicted > 0 {
                            debug!(evicted, "evicted idle contexts");
                        }
                    }
                }
            }
        })
    }
}

fn patterns(records: &[ActionRecord]) -> BTreeMap<ActionKind, ActionStat> {
    let mut patterns: BTreeMap<ActionKind, ActionStat> = BTreeMap::new();
    for record in records {
        let stat = patterns.entry(record.action.kind()).or_insert(ActionStat {
            count: 0,
            successes: 0,
        });
        stat.count += 1;
        if record.result.success {
            stat.successes += 1;
        }
    }
    patterns
}

fn failure_tail(records: &[ActionRecord], limit: usize) -> Vec<FailureNote> {
    let failures: Vec<FailureNote> = records
        .iter()
        .filter(|r| !r.result.success)
        .map(|r| FailureNote {
            step: r.step,
            action: r.action.describe(),
            error: r.result.error.clone().unwrap_or_else(|| "unknown error".to_string()),
        })
        .collect();
    let start = failures.len().saturating_sub(limit);
    failures[start..].to_vec()
}
