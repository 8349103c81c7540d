//! Task executor
//!
//! Owns the live tasks and drives each through the state machine one phase
//! per [`TaskExecutor::step`]. Within a task everything is sequential: the
//! per-task runtime lock is held across a whole phase, so no replan starts
//! while an action or another replan is in flight. Cancellation and pause go
//! through the same lock after signalling, which makes them take effect at
//! the next suspension point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use veer_context::{AgentRole, ContextCoordinator, RoleView};
use veer_core::{
    ActionRecord, EventSink, LifecycleEvent, NullSink, ObstructionRecord, PlanSource, Result, Task, TaskId,
    TaskStatus, VeerConfig, VeerError,
};
use veer_env::{DynamicityClassifier, EnvironmentCache, EnvironmentDriver};
use veer_obstruction::ObstructionHistory;
use veer_oracle::{DecisionOracle, GuardedOracle, Planner, Replanner, Validator};

use crate::runner::{AdaptiveActionRunner, LivePlan, ReplanResolution, RunOutcome, RunScope, SequenceBreak};
use crate::state_machine::{transition, Effect, Event, State};

const CANCEL_REASON: &str = "cancelled by caller";

/// What a caller sees after any executor operation
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Set for terminal states and interrupted phases
    pub reason: Option<String>,
    pub step_count: u32,
    /// Every action result collected so far, never truncated
    pub results: Vec<ActionRecord>,
}

impl TaskReport {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Short account of a task's progress and its recent obstructions
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub goal: String,
    pub status: TaskStatus,
    pub step_count: u32,
    pub recent_obstructions: Vec<ObstructionRecord>,
    pub sequence_break_pending: bool,
}

struct TaskRuntime {
    task: Task,
    state: State,
    live: Option<LivePlan>,
    history: Vec<ActionRecord>,
    needs_replanning: bool,
    validator_feedback: Option<String>,
    pending_break: Option<SequenceBreak>,
    last_planned_step: Option<u32>,
}

impl TaskRuntime {
    fn new(task: Task) -> Self {
        Self {
            task,
            state: State::Pending,
            live: None,
            history: Vec::new(),
            needs_replanning: false,
            validator_feedback: None,
            pending_break: None,
            last_planned_step: None,
        }
    }

    fn report(&self) -> TaskReport {
        TaskReport {
            task_id: self.task.id.clone(),
            status: self.state.status(),
            reason: self.state.reason().map(str::to_string),
            step_count: self.task.step_count,
            results: self.history.clone(),
        }
    }

    /// Why the planner must run before the next action, if it must
    fn plan_due(&self) -> Option<String> {
        if self.live.as_ref().map_or(true, LivePlan::is_empty) {
            return Some("no queued actions".to_string());
        }
        if self.needs_replanning {
            return Some("previous step requested replanning".to_string());
        }
        if self.validator_feedback.is_some() {
            return Some("validator reported the goal incomplete".to_string());
        }
        let interval = self.task.planning_interval.max(1);
        if self.task.step_count % interval == 0 && self.last_planned_step != Some(self.task.step_count) {
            return Some(format!("planning interval of {} steps reached", interval));
        }
        None
    }

    /// Count a failure; yields `Fail` once the consecutive limit is reached
    fn count_failure(&mut self, error: &VeerError) -> Option<Event> {
        self.task.consecutive_failures += 1;
        warn!(
            task_id = %self.task.id,
            failures = self.task.consecutive_failures,
            max = self.task.max_failures,
            error = %error,
            "step failed"
        );
        if self.task.consecutive_failures >= self.task.max_failures {
            let limit = VeerError::MaxFailuresExceeded {
                failures: self.task.consecutive_failures,
            };
            return Some(Event::Fail {
                reason: format!("{}: {}", limit, error),
            });
        }
        None
    }
}

struct TaskHandle {
    cancel: CancellationToken,
    pause_requested: AtomicBool,
    terminal: AtomicBool,
    runtime: Mutex<TaskRuntime>,
}

pub struct TaskExecutorBuilder {
    driver: Arc<dyn EnvironmentDriver>,
    oracle: Arc<dyn DecisionOracle>,
    config: VeerConfig,
    sink: Arc<dyn EventSink>,
    root: Option<PathBuf>,
    classifier: Option<Arc<dyn DynamicityClassifier>>,
}

impl TaskExecutorBuilder {
    pub fn with_config(mut self, config: VeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Persist obstruction history under `<root>/.veer`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DynamicityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Build the executor and start its background tasks.
    ///
    /// Must be called inside a tokio runtime. The cache invalidation listener
    /// and the sweepers stop when the executor is dropped.
    pub fn build(self) -> TaskExecutor {
        let config = self.config;
        let shutdown = CancellationToken::new();

        let cache = Arc::new(EnvironmentCache::from_settings(&config.cache));
        let coordinator = Arc::new(ContextCoordinator::new(config.context.clone()));
        let history = Arc::new(ObstructionHistory::from_settings(
            self.root.as_deref(),
            &config.obstruction,
        ));

        cache
            .clone()
            .spawn_invalidation_listener(self.driver.subscribe_mutations(), shutdown.clone());
        cache
            .clone()
            .spawn_sweeper(config.cache.sweep_interval(), shutdown.clone());
        coordinator
            .clone()
            .spawn_sweeper(config.context.idle_ttl(), shutdown.clone());

        let guard = || GuardedOracle::from_settings(self.oracle.clone(), &config.oracle);
        let planner = Planner::new(guard())
            .with_max_actions(config.agent.max_actions_per_step)
            .with_max_elements(config.context.max_key_elements);
        let validator = Validator::new(guard()).with_max_elements(config.context.max_key_elements);

        let mut runner = AdaptiveActionRunner::new(
            self.driver.clone(),
            cache.clone(),
            Replanner::new(guard()).with_max_elements(config.context.max_key_elements),
            coordinator.clone(),
            history.clone(),
            &config,
        )
        .with_sink(self.sink.clone());
        if let Some(classifier) = self.classifier {
            runner = runner.with_classifier(classifier);
        }

        TaskExecutor {
            driver: self.driver,
            cache,
            coordinator,
            history,
            runner,
            planner,
            validator,
            sink: self.sink,
            tasks: RwLock::new(HashMap::new()),
            shutdown,
        }
    }
}

pub struct TaskExecutor {
    driver: Arc<dyn EnvironmentDriver>,
    cache: Arc<EnvironmentCache>,
    coordinator: Arc<ContextCoordinator>,
    history: Arc<ObstructionHistory>,
    runner: AdaptiveActionRunner,
    planner: Planner,
    validator: Validator,
    sink: Arc<dyn EventSink>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskHandle>>>,
    shutdown: CancellationToken,
}

impl TaskExecutor {
    pub fn builder(driver: Arc<dyn EnvironmentDriver>, oracle: Arc<dyn DecisionOracle>) -> TaskExecutorBuilder {
        TaskExecutorBuilder {
            driver,
            oracle,
            config: VeerConfig::default(),
            sink: Arc::new(NullSink),
            root: None,
            classifier: None,
        }
    }

    pub fn cache(&self) -> &Arc<EnvironmentCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<ContextCoordinator> {
        &self.coordinator
    }

    pub fn history(&self) -> &Arc<ObstructionHistory> {
        &self.history
    }

    /// Stop the background listener and sweepers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Register a task in Pending. Rejected while a live task has the same id.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn submit(&self, task: Task) -> Result<TaskId> {
        let id = task.id.clone();
        let session = task.session_id.clone();
        {
            let mut tasks = self.tasks.write().await;
            if let Some(existing) = tasks.get(&id) {
                if !existing.terminal.load(Ordering::Acquire) {
                    return Err(VeerError::TaskAlreadyLive(id.to_string()));
                }
            }
            let handle = TaskHandle {
                cancel: self.shutdown.child_token(),
                pause_requested: AtomicBool::new(false),
                terminal: AtomicBool::new(false),
                runtime: Mutex::new(TaskRuntime::new(task)),
            };
            tasks.insert(id.clone(), Arc::new(handle));
        }

        match self.history.load(&session).await {
            Ok(0) => {}
            Ok(loaded) => debug!(session = %session, loaded, "obstruction history loaded"),
            Err(e) => warn!(session = %session, error = %e, "obstruction history not loaded"),
        }
        info!("task submitted");
        Ok(id)
    }

    async fn handle(&self, task_id: &TaskId) -> Result<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| VeerError::TaskNotFound(task_id.to_string()))
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        let handle = self.handle(task_id).await?;
        let runtime = handle.runtime.lock().await;
        Ok(runtime.state.status())
    }

    pub async fn report(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        let runtime = handle.runtime.lock().await;
        Ok(runtime.report())
    }

    pub async fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.read().await.keys().cloned().collect()
    }

    /// Advance the task by one phase.
    ///
    /// Paused and terminal tasks are returned unchanged.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn step(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        let mut rt = handle.runtime.lock().await;

        if rt.state.is_terminal() || matches!(rt.state, State::Paused { .. }) {
            return Ok(rt.report());
        }
        if handle.pause_requested.load(Ordering::Acquire) && rt.state.is_pausable() {
            self.apply(&handle, &mut rt, Event::Pause).await;
            return Ok(rt.report());
        }

        let phase = match rt.state.clone() {
            State::Pending => Ok(Some(Event::Start)),
            State::Planning => self.plan_phase(&handle, &mut rt).await,
            State::Executing => self.execute_phase(&handle, &mut rt).await,
            State::Replanning { reason } => self.replan_phase(&handle, &mut rt, &reason).await,
            State::Validating { claim } => self.validate_phase(&handle, &mut rt, &claim).await,
            _ => Ok(None),
        };

        let event = match phase {
            // A result that arrives after cancellation is discarded
            _ if handle.cancel.is_cancelled() => Some(Event::Cancel {
                reason: CANCEL_REASON.to_string(),
            }),
            Ok(event) => event,
            Err(VeerError::TaskCancelled) => Some(Event::Cancel {
                reason: CANCEL_REASON.to_string(),
            }),
            Err(e) => Some(Event::Fail { reason: e.to_string() }),
        };
        if let Some(event) = event {
            self.apply(&handle, &mut rt, event).await;
        }
        rt.task.touch();
        Ok(rt.report())
    }

    /// Step until the task is terminal or paused
    pub async fn run(&self, task_id: &TaskId) -> Result<TaskReport> {
        loop {
            let report = self.step(task_id).await?;
            if report.is_terminal() || report.status == TaskStatus::Paused {
                return Ok(report);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Cancel from any live state; aborts whatever the task is awaiting
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        handle.cancel.cancel();
        let mut rt = handle.runtime.lock().await;
        if !rt.state.is_terminal() {
            self.apply(
                &handle,
                &mut rt,
                Event::Cancel {
                    reason: CANCEL_REASON.to_string(),
                },
            )
            .await;
        }
        Ok(rt.report())
    }

    /// Stop scheduling new steps.
    ///
    /// Takes effect once the phase in flight finishes. Requested while
    /// planning or validating, it applies as soon as the task executes again.
    pub async fn pause(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        if handle.terminal.load(Ordering::Acquire) {
            return Err(VeerError::InvalidTransition(format!("task {} has already finished", task_id)));
        }
        handle.pause_requested.store(true, Ordering::Release);
        let mut rt = handle.runtime.lock().await;
        if rt.state.is_pausable() {
            self.apply(&handle, &mut rt, Event::Pause).await;
        }
        Ok(rt.report())
    }

    /// Continue a paused task from its remaining actions
    pub async fn resume(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        handle.pause_requested.store(false, Ordering::Release);
        let mut rt = handle.runtime.lock().await;
        match rt.state {
            State::Paused { .. } => {
                self.apply(&handle, &mut rt, Event::Resume).await;
                Ok(rt.report())
            }
            ref state if state.is_terminal() => Err(VeerError::InvalidTransition(format!(
                "task {} has already finished",
                task_id
            ))),
            // Pause was still pending; clearing the flag is enough
            _ => Ok(rt.report()),
        }
    }

    /// Forget a finished task along with its context and cached snapshot
    pub async fn cleanup(&self, task_id: &TaskId) -> Result<TaskReport> {
        let handle = self.handle(task_id).await?;
        let (report, session) = {
            let rt = handle.runtime.lock().await;
            if !rt.state.is_terminal() {
                return Err(VeerError::InvalidTransition(format!(
                    "task {} is still {}",
                    task_id,
                    rt.state.status()
                )));
            }
            (rt.report(), rt.task.session_id.clone())
        };
        self.tasks.write().await.remove(task_id);
        self.coordinator.remove(task_id).await;
        self.cache.remove(&session).await;
        debug!(task_id = %task_id, "task cleaned up");
        Ok(report)
    }

    pub async fn memory_summary(&self, task_id: &TaskId) -> Result<MemorySummary> {
        let handle = self.handle(task_id).await?;
        let rt = handle.runtime.lock().await;
        Ok(MemorySummary {
            goal: rt.task.goal.clone(),
            status: rt.state.status(),
            step_count: rt.task.step_count,
            recent_obstructions: self.history.recent(&rt.task.session_id, 5).await,
            sequence_break_pending: rt.pending_break.is_some(),
        })
    }

    async fn apply(&self, handle: &TaskHandle, rt: &mut TaskRuntime, event: Event) {
        let from = rt.state.status();
        let was_paused = matches!(rt.state, State::Paused { .. });
        let (next, effects) = transition(rt.state.clone(), event);
        rt.state = next;
        rt.task.status = rt.state.status();

        // A paused task's notes must outlive the idle sweeper
        match (was_paused, matches!(rt.state, State::Paused { .. })) {
            (false, true) => {
                self.coordinator.pin(&rt.task.id).await;
            }
            (true, false) => {
                self.coordinator.unpin(&rt.task.id).await;
            }
            _ => {}
        }

        for effect in effects {
            match effect {
                Effect::LogActivity { message } => info!(task_id = %rt.task.id, "{}", message),
                Effect::ReleasePlan => rt.live = None,
                Effect::AbortInFlight => handle.cancel.cancel(),
            }
        }
        if rt.state.is_terminal() {
            handle.terminal.store(true, Ordering::Release);
        }

        let to = rt.state.status();
        if from != to {
            self.sink
                .emit(LifecycleEvent::StateChanged {
                    task_id: rt.task.id.clone(),
                    from,
                    to,
                    reason: rt.state.reason().map(str::to_string),
                })
                .await;
        }
    }

    async fn plan_phase(&self, handle: &TaskHandle, rt: &mut TaskRuntime) -> Result<Option<Event>> {
        let session = rt.task.session_id.clone();
        let snapshot = match self.cache.get_or_fetch(&session, self.driver.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e @ VeerError::Environment(_)) => return Ok(rt.count_failure(&e)),
            Err(e) => return Err(e),
        };

        if let Some(feedback) = rt.validator_feedback.take() {
            self.coordinator
                .note(&rt.task.id, AgentRole::Planner, format!("validator: {}", feedback))
                .await;
        }
        let context = self
            .coordinator
            .get_or_update(&rt.task.id, &rt.task.goal, &snapshot, &rt.history)
            .await;
        let view = RoleView::project(&context, AgentRole::Planner);

        let plan = match self
            .planner
            .plan(&rt.task.goal, &view, &snapshot, &handle.cancel)
            .await
        {
            Ok(plan) if plan.is_empty() => {
                return Ok(rt.count_failure(&VeerError::OracleMalformed("plan has no actions".to_string())))
            }
            Ok(plan) => plan,
            Err(e @ VeerError::OracleMalformed(_)) => return Ok(rt.count_failure(&e)),
            Err(e) => return Err(e),
        };

        let scope = RunScope {
            task_id: &rt.task.id,
            session: &session,
            step: rt.task.step_count,
        };
        let live = self.runner.prepare(&scope, &plan, &snapshot).await;
        self.sink
            .emit(LifecycleEvent::PlanUpdated {
                task_id: rt.task.id.clone(),
                source: PlanSource::Planner,
                actions: plan.len(),
                mode: live.mode(),
            })
            .await;

        rt.live = Some(live);
        rt.needs_replanning = false;
        rt.pending_break = None;
        rt.last_planned_step = Some(rt.task.step_count);
        Ok(Some(Event::PlanReady { actions: plan.len() }))
    }

    async fn execute_phase(&self, handle: &TaskHandle, rt: &mut TaskRuntime) -> Result<Option<Event>> {
        if rt.task.step_count >= rt.task.max_steps {
            let reason = VeerError::MaxStepsExceeded {
                steps: rt.task.step_count,
            };
            return Ok(Some(Event::Fail {
                reason: reason.to_string(),
            }));
        }
        if let Some(reason) = rt.plan_due() {
            return Ok(Some(Event::PlanDue { reason }));
        }

        let TaskRuntime { task, live, .. } = &mut *rt;
        let Some(live) = live.as_mut() else {
            return Ok(Some(Event::PlanDue {
                reason: "no live plan".to_string(),
            }));
        };
        let scope = RunScope {
            task_id: &task.id,
            session: &task.session_id,
            step: task.step_count + 1,
        };
        let report = self.runner.run(&scope, live, &handle.cancel).await;

        rt.task.step_count += 1;
        if report.records.last().is_some_and(|r| r.result.success) {
            rt.task.consecutive_failures = 0;
        }
        rt.history.extend(report.records);

        let event = match report.outcome {
            RunOutcome::Exhausted => None,
            RunOutcome::Done { success: true, text } => Some(Event::DoneClaimed { claim: text }),
            RunOutcome::Done { success: false, text } => Some(Event::Fail {
                reason: format!("gave up: {}", text),
            }),
            RunOutcome::Break(brk) => {
                let reason = brk.reason.clone();
                rt.pending_break = Some(brk);
                Some(Event::SequenceBreak { reason })
            }
            RunOutcome::ActionFailed { index, message } => rt.count_failure(&VeerError::action(index, message)),
            RunOutcome::Cancelled => Some(Event::Cancel {
                reason: CANCEL_REASON.to_string(),
            }),
            RunOutcome::Error(e @ VeerError::Environment(_)) => {
                rt.needs_replanning = true;
                rt.count_failure(&e)
            }
            RunOutcome::Error(e) => Some(Event::Fail { reason: e.to_string() }),
        };
        Ok(event)
    }

    async fn replan_phase(&self, handle: &TaskHandle, rt: &mut TaskRuntime, reason: &str) -> Result<Option<Event>> {
        let TaskRuntime {
            task, live, history, ..
        } = &mut *rt;
        let Some(live) = live.as_mut() else {
            rt.needs_replanning = true;
            return Ok(Some(Event::ReplanAbandoned {
                reason: "no live plan to repair".to_string(),
            }));
        };
        let scope = RunScope {
            task_id: &task.id,
            session: &task.session_id,
            step: task.step_count,
        };

        let resolution = match self.runner.replan(&scope, live, reason, history, &handle.cancel).await {
            Ok(resolution) => resolution,
            Err(e @ VeerError::Environment(_)) => return Ok(rt.count_failure(&e)),
            Err(e) => return Err(e),
        };

        rt.pending_break = None;
        let event = match resolution {
            ReplanResolution::Spliced { .. } | ReplanResolution::Readmitted => {
                rt.last_planned_step = Some(rt.task.step_count);
                Event::Replanned
            }
            ReplanResolution::Abandoned { reason } => {
                rt.needs_replanning = true;
                Event::ReplanAbandoned { reason }
            }
        };
        Ok(Some(event))
    }

    async fn validate_phase(&self, handle: &TaskHandle, rt: &mut TaskRuntime, claim: &str) -> Result<Option<Event>> {
        let session = rt.task.session_id.clone();
        let snapshot = match self.cache.fresh(&session, self.driver.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e @ VeerError::Environment(_)) => return Ok(rt.count_failure(&e)),
            Err(e) => return Err(e),
        };
        let context = self
            .coordinator
            .get_or_update(&rt.task.id, &rt.task.goal, &snapshot, &rt.history)
            .await;
        let view = RoleView::project(&context, AgentRole::Validator);

        let verdict = match self.validator.validate(&view, claim, &snapshot, &handle.cancel).await {
            Ok(verdict) => verdict,
            Err(e @ VeerError::OracleMalformed(_)) => return Ok(rt.count_failure(&e)),
            Err(e) => return Err(e),
        };

        if verdict.is_complete {
            let summary = if claim.is_empty() { verdict.reason } else { claim.to_string() };
            return Ok(Some(Event::ValidationPassed { summary }));
        }
        info!(task_id = %rt.task.id, reason = %verdict.reason, "completion rejected");
        rt.validator_feedback = Some(verdict.reason.clone());
        Ok(Some(Event::ValidationFailed {
            reason: verdict.reason,
        }))
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
