//! Adaptive action runner
//!
//! Executes one live plan against the environment. Before each index-targeting
//! action the target is re-resolved whenever the cache generation moved, the
//! TTL lapsed or a recovery forced it, so no action runs blind against an
//! outdated snapshot. After an action (every action in single-step mode, only
//! the interruption point or the last action in batch mode) the runner
//! classifies the change. A disruptive change is a mandatory sequence break:
//! the obstruction handler gets the first try and the replanner the second.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use veer_context::{AgentRole, ContextCoordinator};
use veer_core::config::RunnerSettings;
use veer_core::{
    Action, ActionPlan, ActionRecord, ActionResult, ChangeKind, ElementNode, EnvironmentSnapshot, EventSink,
    ExecutionMode, LifecycleEvent, NullSink, PlanSource, Result, SessionId, TaskId, VeerConfig, VeerError,
};
use veer_env::{ChangeDetector, DynamicityClassifier, EnvironmentCache, EnvironmentDriver, HeuristicClassifier};
use veer_obstruction::{ObstructionHandler, ObstructionHistory, PredictiveObstructionDetector};
use veer_oracle::{ReplanOutcome, ReplanRequest, Replanner};

/// Who is running and at which step
#[derive(Debug, Clone, Copy)]
pub struct RunScope<'a> {
    pub task_id: &'a TaskId,
    pub session: &'a SessionId,
    /// Step number stamped on every record produced
    pub step: u32,
}

#[derive(Debug, Clone)]
struct QueuedAction {
    action: Action,
    /// Element the index pointed at when it was last resolved
    target: Option<ElementNode>,
    /// Cache generation the index is valid for
    resolved_at: u64,
}

fn queue_from(actions: &[Action], basis: &EnvironmentSnapshot) -> VecDeque<QueuedAction> {
    actions
        .iter()
        .map(|action| QueuedAction {
            action: action.clone(),
            target: action.target_index().and_then(|i| basis.element(i)).cloned(),
            resolved_at: basis.generation,
        })
        .collect()
}

/// The one plan a task is currently executing
#[derive(Debug, Clone)]
pub struct LivePlan {
    pub plan_id: String,
    pub goal: String,
    mode: ExecutionMode,
    queue: VecDeque<QueuedAction>,
    replans: u32,
    force_resolve: bool,
}

impl LivePlan {
    /// Wrap a plan whose indices refer to `basis`
    pub fn new(plan: &ActionPlan, basis: &EnvironmentSnapshot) -> Self {
        Self {
            plan_id: plan.id.clone(),
            goal: plan.goal.clone(),
            mode: plan.mode,
            queue: queue_from(&plan.actions, basis),
            replans: 0,
            force_resolve: false,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Actions not yet executed, in order
    pub fn remaining(&self) -> Vec<Action> {
        self.queue.iter().map(|q| q.action.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    fn splice(&mut self, actions: &[Action], basis: &EnvironmentSnapshot) {
        self.queue = queue_from(actions, basis);
        self.force_resolve = false;
    }

    fn readmit(&mut self) {
        self.force_resolve = true;
    }

    fn discard(&mut self) {
        self.queue.clear();
    }
}

/// Why the runner stopped executing the remaining actions
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBreak {
    pub reason: String,
    /// Change class behind the break; `None` for a stale index
    pub kind: Option<ChangeKind>,
    /// Action after which the change was observed
    pub interrupted: Option<Action>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Every queued action ran
    Exhausted,
    /// A `done` action ran
    Done { success: bool, text: String },
    /// Remaining actions need the replanner
    Break(SequenceBreak),
    ActionFailed { index: Option<usize>, message: String },
    Cancelled,
    Error(VeerError),
}

/// Records produced by one run, whatever the outcome
#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<ActionRecord>,
    pub outcome: RunOutcome,
}

/// How a replanning round left the live plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanResolution {
    Spliced { actions: usize },
    /// Original remaining actions kept, re-resolved before they run
    Readmitted,
    /// Nothing usable; the plan was discarded
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: ExecutionMode,
    pub reason: String,
}

impl ModeDecision {
    fn new(mode: ExecutionMode, reason: impl Into<String>) -> Self {
        Self {
            mode,
            reason: reason.into(),
        }
    }
}

pub struct AdaptiveActionRunner {
    driver: Arc<dyn EnvironmentDriver>,
    cache: Arc<EnvironmentCache>,
    detector: ChangeDetector,
    handler: ObstructionHandler,
    predictor: PredictiveObstructionDetector,
    classifier: Arc<dyn DynamicityClassifier>,
    replanner: Replanner,
    coordinator: Arc<ContextCoordinator>,
    sink: Arc<dyn EventSink>,
    settings: RunnerSettings,
}

impl AdaptiveActionRunner {
    pub fn new(
        driver: Arc<dyn EnvironmentDriver>,
        cache: Arc<EnvironmentCache>,
        replanner: Replanner,
        coordinator: Arc<ContextCoordinator>,
        history: Arc<ObstructionHistory>,
        config: &VeerConfig,
    ) -> Self {
        let detector = ChangeDetector::new(&config.detector);
        let handler = ObstructionHandler::new(
            driver.clone(),
            history.clone(),
            detector.clone(),
            config.obstruction.clone(),
        );
        Self {
            driver,
            cache,
            detector,
            handler,
            predictor: PredictiveObstructionDetector::new(history),
            classifier: Arc::new(HeuristicClassifier),
            replanner,
            coordinator,
            sink: Arc::new(NullSink),
            settings: config.runner.clone(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DynamicityClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Pick batch or single-step execution for a plan.
    ///
    /// Batch only when the plan has no dynamic-triggering actions, or has
    /// fewer than the threshold on a page that looks static and where history
    /// predicts no disruption.
    pub async fn decide_mode(
        &self,
        scope: &RunScope<'_>,
        plan: &ActionPlan,
        snapshot: &EnvironmentSnapshot,
    ) -> ModeDecision {
        let dynamic = plan.dynamic_trigger_count();
        if dynamic == 0 {
            return ModeDecision::new(ExecutionMode::Batch, "no dynamic-triggering actions");
        }
        if plan.mode == ExecutionMode::SingleStep {
            return ModeDecision::new(ExecutionMode::SingleStep, "requested by planner");
        }
        if dynamic >= self.settings.dynamic_action_threshold {
            return ModeDecision::new(
                ExecutionMode::SingleStep,
                format!("{} dynamic-triggering actions", dynamic),
            );
        }

        let score = self.classifier.classify(snapshot);
        if score.is_dynamic() {
            return ModeDecision::new(
                ExecutionMode::SingleStep,
                format!("dynamic page: {}", score.indicators.join(", ")),
            );
        }

        let forecast = self.predictor.predict(scope.session, plan, snapshot).await;
        if !forecast.ranked.is_empty() {
            self.sink
                .emit(LifecycleEvent::ObstructionPredicted {
                    task_id: scope.task_id.clone(),
                    predictions: forecast.ranked.clone(),
                })
                .await;
        }
        if forecast.expects_disruption(self.settings.prediction_threshold) {
            return ModeDecision::new(ExecutionMode::SingleStep, "obstruction predicted from history");
        }
        ModeDecision::new(ExecutionMode::Batch, "few dynamic actions on a static page")
    }

    /// Turn a fresh plan into the live plan, with its execution mode decided
    pub async fn prepare(&self, scope: &RunScope<'_>, plan: &ActionPlan, basis: &EnvironmentSnapshot) -> LivePlan {
        let decision = self.decide_mode(scope, plan, basis).await;
        info!(mode = %decision.mode, reason = %decision.reason, actions = plan.len(), "execution mode decided");
        let mut live = LivePlan::new(plan, basis);
        live.mode = decision.mode;
        live
    }

    /// Execute the live plan until it is exhausted, completes, fails or breaks.
    ///
    /// Executed actions are popped from the plan; on a break the remaining
    /// actions stay queued for [`AdaptiveActionRunner::replan`].
    #[instrument(skip(self, scope, live, cancel), fields(task_id = %scope.task_id, step = scope.step, mode = %live.mode))]
    pub async fn run(&self, scope: &RunScope<'_>, live: &mut LivePlan, cancel: &CancellationToken) -> RunReport {
        let mut records = Vec::new();
        let outcome = match self.drive(scope, live, &mut records, cancel).await {
            Ok(outcome) => outcome,
            Err(VeerError::TaskCancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Error(e),
        };
        RunReport { records, outcome }
    }

    async fn drive(
        &self,
        scope: &RunScope<'_>,
        live: &mut LivePlan,
        records: &mut Vec<ActionRecord>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if live.queue.is_empty() {
                return Ok(RunOutcome::Exhausted);
            }

            let (action, before) = match self.resolve_head(scope.session, live).await {
                Ok(resolved) => resolved,
                Err(e) if e.is_stale_index() => {
                    let reason = e.to_string();
                    self.announce_break(scope, &reason, live.len(), None).await;
                    return Ok(RunOutcome::Break(SequenceBreak {
                        reason,
                        kind: None,
                        interrupted: None,
                    }));
                }
                Err(e) => return Err(e),
            };

            let result = self.perform(scope.session, &action, cancel).await?;
            live.queue.pop_front();
            self.sink
                .emit(LifecycleEvent::ActionExecuted {
                    task_id: scope.task_id.clone(),
                    step: scope.step,
                    kind: action.kind(),
                    success: result.success,
                })
                .await;
            records.push(ActionRecord::new(scope.step, action.clone(), result.clone()));
            if result.dom_changed {
                self.cache.invalidate(scope.session);
            }

            if result.is_done {
                let text = match &action {
                    Action::Done { text, .. } => text.clone(),
                    _ => result.extracted_content.clone().unwrap_or_default(),
                };
                return Ok(RunOutcome::Done {
                    success: result.success,
                    text,
                });
            }
            if !result.success {
                let message = result.error.unwrap_or_else(|| "action failed".to_string());
                warn!(action = %action.describe(), error = %message, "action failed");
                return Ok(RunOutcome::ActionFailed {
                    index: action.target_index(),
                    message,
                });
            }

            let check = match live.mode {
                ExecutionMode::Batch => result.dom_changed || live.queue.is_empty(),
                _ => true,
            };
            if !check {
                continue;
            }

            if live.mode != ExecutionMode::Batch {
                self.settle(scope.session, cancel).await?;
            } else if !live.queue.is_empty() {
                info!(remaining = live.len(), "batch interrupted by a page change, continuing single-step");
                live.mode = ExecutionMode::SingleStep;
            }

            let after = self.cache.fresh(scope.session, self.driver.as_ref()).await?;
            let analysis = self.detector.analyze(&before, &after, Some(&action));
            if analysis.kind != ChangeKind::None {
                if let Some(record) = records.last_mut() {
                    annotate(&mut record.result, &action, &analysis.description);
                }
            }

            if !analysis.kind.is_disruptive() {
                if analysis.kind == ChangeKind::Minor {
                    debug!(description = %analysis.description, "minor change ignored");
                }
                continue;
            }

            self.announce_break(scope, &analysis.description, live.len(), Some(&action))
                .await;
            let outcome = self
                .handler
                .handle(
                    scope.session,
                    &analysis,
                    Some(&action),
                    &before,
                    after.as_ref().clone(),
                    cancel,
                )
                .await?;
            for record in &outcome.records {
                self.sink
                    .emit(LifecycleEvent::ObstructionOutcome {
                        task_id: scope.task_id.clone(),
                        record: record.clone(),
                    })
                    .await;
            }
            // Whatever the handler did, the cached view predates it
            self.cache.invalidate(scope.session);

            if outcome.handled {
                self.coordinator
                    .note(scope.task_id, AgentRole::Navigator, format!("recovered: {}", outcome.note))
                    .await;
                live.readmit();
                continue;
            }

            return Ok(RunOutcome::Break(SequenceBreak {
                reason: format!("{} ({})", analysis.description, outcome.note),
                kind: Some(analysis.kind),
                interrupted: Some(action),
            }));
        }
    }

    /// Resolve the head action against the freshest valid snapshot.
    ///
    /// Returns the action with its index rewritten and the snapshot it is
    /// valid for, or `StaleIndex` when the target cannot be found again.
    async fn resolve_head(
        &self,
        session: &SessionId,
        live: &mut LivePlan,
    ) -> Result<(Action, Arc<EnvironmentSnapshot>)> {
        let (current, refreshed) = match self.cache.get(session).await {
            Some(snapshot) => (snapshot, false),
            None => (self.cache.fresh(session, self.driver.as_ref()).await?, true),
        };

        let force = live.force_resolve;
        let head = live
            .queue
            .front_mut()
            .ok_or_else(|| VeerError::Other("no queued action to resolve".to_string()))?;
        let Some(index) = head.action.target_index() else {
            return Ok((head.action.clone(), current));
        };
        if !force && !refreshed && head.resolved_at == current.generation {
            return Ok((head.action.clone(), current));
        }

        let target = head.target.as_ref().ok_or_else(|| VeerError::StaleIndex {
            index,
            reason: "target was never observed".to_string(),
        })?;
        let resolved = current.resolve(target).ok_or_else(|| VeerError::StaleIndex {
            index,
            reason: format!("{} is gone or ambiguous", target.label().unwrap_or(&target.tag)),
        })?;

        if resolved.index != index {
            info!(from = index, to = resolved.index, "target shifted, index re-resolved");
        }
        head.action = head.action.with_index(resolved.index);
        head.target = Some(resolved.clone());
        head.resolved_at = current.generation;
        let action = head.action.clone();
        live.force_resolve = false;
        Ok((action, current))
    }

    async fn perform(&self, session: &SessionId, action: &Action, cancel: &CancellationToken) -> Result<ActionResult> {
        debug!(action = %action.describe(), "performing");
        tokio::select! {
            _ = cancel.cancelled() => Err(VeerError::TaskCancelled),
            result = self.driver.perform(session, action) => result,
        }
    }

    async fn settle(&self, session: &SessionId, cancel: &CancellationToken) -> Result<()> {
        if self.settings.stabilization_ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(VeerError::TaskCancelled),
            result = self.driver.wait(session, self.settings.stabilization_ms) => result,
        }
    }

    async fn announce_break(&self, scope: &RunScope<'_>, reason: &str, discarded: usize, after: Option<&Action>) {
        warn!(reason, discarded, "sequence break");
        self.sink
            .emit(LifecycleEvent::SequenceBreak {
                task_id: scope.task_id.clone(),
                reason: reason.to_string(),
                discarded,
            })
            .await;
        let note = match after {
            Some(action) => format!("sequence break after {}: {}", action.describe(), reason),
            None => format!("sequence break: {}", reason),
        };
        self.coordinator
            .note(scope.task_id, AgentRole::Navigator, note)
            .await;
    }

    /// Ask the replanner to repair the remaining actions of a broken plan.
    ///
    /// At most `max_replans_per_plan` rounds per live plan; past that the plan
    /// is abandoned so the executor plans from scratch.
    #[instrument(skip(self, scope, live, completed, cancel), fields(task_id = %scope.task_id, remaining = live.len()))]
    pub async fn replan(
        &self,
        scope: &RunScope<'_>,
        live: &mut LivePlan,
        reason: &str,
        completed: &[ActionRecord],
        cancel: &CancellationToken,
    ) -> Result<ReplanResolution> {
        if live.replans >= self.settings.max_replans_per_plan {
            live.discard();
            return Ok(ReplanResolution::Abandoned {
                reason: format!("replan limit of {} reached", self.settings.max_replans_per_plan),
            });
        }
        live.replans += 1;

        self.cache.invalidate(scope.session);
        let snapshot = self.cache.fresh(scope.session, self.driver.as_ref()).await?;
        let notes = match self.coordinator.get(scope.task_id).await {
            Some(context) => context.scratch_for(AgentRole::Navigator).to_vec(),
            None => Vec::new(),
        };
        let remaining = live.remaining();

        let outcome = self
            .replanner
            .replan(
                ReplanRequest {
                    goal: &live.goal,
                    reason,
                    remaining: &remaining,
                    snapshot: &snapshot,
                    completed,
                    notes: &notes,
                },
                cancel,
            )
            .await?;

        let resolution = match outcome {
            ReplanOutcome::Updated {
                actions,
                mode,
                analysis,
                ..
            } => {
                let plan = ActionPlan::new(live.goal.clone(), actions, mode).with_basis(snapshot.generation);
                let decision = self.decide_mode(scope, &plan, &snapshot).await;
                live.splice(&plan.actions, &snapshot);
                live.mode = decision.mode;
                self.sink
                    .emit(LifecycleEvent::PlanUpdated {
                        task_id: scope.task_id.clone(),
                        source: PlanSource::Replanner,
                        actions: plan.len(),
                        mode: decision.mode,
                    })
                    .await;
                self.coordinator
                    .note(scope.task_id, AgentRole::Navigator, format!("replanned: {}", analysis))
                    .await;
                ReplanResolution::Spliced { actions: plan.len() }
            }
            ReplanOutcome::Unchanged { analysis } => {
                live.readmit();
                self.coordinator
                    .note(scope.task_id, AgentRole::Navigator, format!("plan kept: {}", analysis))
                    .await;
                ReplanResolution::Readmitted
            }
            ReplanOutcome::Rejected { reason } => {
                live.readmit();
                self.coordinator
                    .note(scope.task_id, AgentRole::Navigator, format!("replan rejected, plan kept: {}", reason))
                    .await;
                ReplanResolution::Readmitted
            }
            ReplanOutcome::Unusable { reason } => {
                live.discard();
                ReplanResolution::Abandoned { reason }
            }
        };
        info!(?resolution, round = live.replans, "replanning round finished");
        Ok(resolution)
    }
}

/// Fold the observed change into the long-term memory line of a result
fn annotate(result: &mut ActionResult, action: &Action, change: &str) {
    let base = result
        .long_term_memory
        .clone()
        .unwrap_or_else(|| action.describe());
    result.long_term_memory = Some(format!("{}; {}", base, change));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veer_core::fail_open::RetryPolicy;
    use veer_core::{ActionKind, ElementNode, RecordingSink};
    use veer_env::{Effect, FixedClassifier, Rule, ScriptedDriver};
    use veer_oracle::{GuardedOracle, ScriptedOracle};

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    fn task() -> TaskId {
        TaskId::from("t1")
    }

    fn config() -> VeerConfig {
        let mut config = VeerConfig::default();
        config.runner.stabilization_ms = 0;
        config.obstruction.poll_interval_ms = 5;
        config.obstruction.stabilize_timeout_ms = 50;
        config
    }

    fn button(label: &str) -> ElementNode {
        ElementNode::new(0, "button").with_text(label)
    }

    struct Harness {
        driver: ScriptedDriver,
        cache: Arc<EnvironmentCache>,
        sink: RecordingSink,
        runner: AdaptiveActionRunner,
    }

    fn harness(driver: ScriptedDriver, oracle: ScriptedOracle) -> Harness {
        let config = config();
        let cache = Arc::new(EnvironmentCache::from_settings(&config.cache));
        let sink = RecordingSink::new();
        let replanner = Replanner::new(GuardedOracle::new(
            Arc::new(oracle),
            Duration::from_secs(1),
            RetryPolicy::none(),
        ));
        let runner = AdaptiveActionRunner::new(
            Arc::new(driver.clone()),
            cache.clone(),
            replanner,
            Arc::new(ContextCoordinator::new(config.context.clone())),
            Arc::new(ObstructionHistory::in_memory(50)),
            &config,
        )
        .with_classifier(Arc::new(FixedClassifier(0.0)))
        .with_sink(Arc::new(sink.clone()));
        Harness {
            driver,
            cache,
            sink,
            runner,
        }
    }

    async fn live_plan(h: &Harness, actions: Vec<Action>) -> LivePlan {
        let basis = h.cache.fresh(&session(), &h.driver).await.unwrap();
        let plan = ActionPlan::new("test", actions, ExecutionMode::Adaptive).with_basis(basis.generation);
        let task_id = task();
        let session = session();
        let scope = RunScope {
            task_id: &task_id,
            session: &session,
            step: 1,
        };
        h.runner.prepare(&scope, &plan, &basis).await
    }

    async fn run(h: &Harness, live: &mut LivePlan) -> RunReport {
        let task_id = task();
        let session = session();
        let scope = RunScope {
            task_id: &task_id,
            session: &session,
            step: 1,
        };
        h.runner.run(&scope, live, &CancellationToken::new()).await
    }

    fn page(elements: Vec<ElementNode>) -> ScriptedDriver {
        ScriptedDriver::new().with_page(session(), "https://mail.example/compose", elements)
    }

    #[tokio::test]
    async fn test_mode_decision() {
        let h = harness(page(vec![button("Compose"), button("Send")]), ScriptedOracle::new());
        let scroll = Action::Scroll {
            direction: veer_core::ScrollDirection::Down,
            amount: None,
        };

        let live = live_plan(&h, vec![scroll.clone(), Action::Wait { ms: 1 }]).await;
        assert_eq!(live.mode(), ExecutionMode::Batch);

        let live = live_plan(&h, vec![Action::Click { index: 0 }, scroll]).await;
        assert_eq!(live.mode(), ExecutionMode::Batch);

        let live = live_plan(&h, vec![Action::Click { index: 0 }, Action::Click { index: 1 }]).await;
        assert_eq!(live.mode(), ExecutionMode::SingleStep);
    }

    #[tokio::test]
    async fn test_dynamic_page_forces_single_step() {
        let h = harness(page(vec![button("Compose")]), ScriptedOracle::new());
        let h = Harness {
            runner: h.runner.with_classifier(Arc::new(FixedClassifier(0.9))),
            ..h
        };
        let live = live_plan(&h, vec![Action::Click { index: 0 }]).await;
        assert_eq!(live.mode(), ExecutionMode::SingleStep);
    }

    #[tokio::test]
    async fn test_static_batch_checks_only_after_last_action() {
        let h = harness(page(vec![button("Compose")]), ScriptedOracle::new());
        let mut live = live_plan(
            &h,
            vec![
                Action::SendKeys {
                    keys: "Tab".to_string(),
                },
                Action::Wait { ms: 1 },
                Action::Wait { ms: 1 },
            ],
        )
        .await;
        let calls_before = h.driver.snapshot_calls();

        let report = run(&h, &mut live).await;
        assert!(matches!(report.outcome, RunOutcome::Exhausted));
        assert_eq!(report.records.len(), 3);
        assert_eq!(h.driver.snapshot_calls(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_mutation_mid_batch_re_resolves_next_target() {
        let h = harness(
            page(vec![ElementNode::new(0, "input").with_attr("aria-label", "Search"), button("Send")]),
            ScriptedOracle::new(),
        );
        let listener = CancellationToken::new();
        h.cache
            .clone()
            .spawn_invalidation_listener(h.driver.subscribe_mutations(), listener.clone());

        let mut live = live_plan(&h, vec![Action::Wait { ms: 100 }, Action::Click { index: 1 }]).await;
        assert_eq!(live.mode(), ExecutionMode::Batch);

        let injector = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.driver.inject(
                &session(),
                Effect::InsertAfter {
                    label: "Search".to_string(),
                    elements: vec![ElementNode::new(0, "div").with_text("You are offline").non_interactive()],
                },
            );
        };
        let (report, _) = tokio::join!(run(&h, &mut live), injector);
        listener.cancel();

        assert!(matches!(report.outcome, RunOutcome::Exhausted));
        assert_eq!(h.driver.performed()[1], Action::Click { index: 2 });
    }

    #[tokio::test]
    async fn test_vanished_target_breaks_the_sequence() {
        let driver = page(vec![button("Compose"), button("Send")]).with_rule(
            Rule::on_target(ActionKind::Click, "Compose").then(Effect::RemoveLabeled {
                label: "Send".to_string(),
            }),
        );
        let h = harness(driver, ScriptedOracle::new());
        let mut live = live_plan(&h, vec![Action::Click { index: 0 }, Action::Click { index: 1 }]).await;

        let report = run(&h, &mut live).await;
        match report.outcome {
            RunOutcome::Break(brk) => {
                assert!(brk.kind.is_none());
                assert!(brk.reason.contains("Stale index 1"));
            }
            other => panic!("expected a sequence break, got {:?}", other),
        }
        assert_eq!(h.driver.performed(), vec![Action::Click { index: 0 }]);
        assert_eq!(live.remaining(), vec![Action::Click { index: 1 }]);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::SequenceBreak { discarded: 1, .. })));
    }

    #[tokio::test]
    async fn test_done_and_failure_halt_the_loop() {
        let h = harness(page(vec![button("Compose"), button("Send")]), ScriptedOracle::new());
        let mut live = live_plan(
            &h,
            vec![
                Action::Done {
                    success: true,
                    text: "sent".to_string(),
                },
                Action::Wait { ms: 1 },
            ],
        )
        .await;
        let report = run(&h, &mut live).await;
        assert!(matches!(report.outcome, RunOutcome::Done { success: true, ref text } if text == "sent"));
        assert_eq!(report.records.len(), 1);

        let driver = page(vec![button("Compose"), button("Send")]).with_rule(
            Rule::on_target(ActionKind::Click, "Compose").then(Effect::Fail {
                message: "button disabled".to_string(),
            }),
        );
        let h = harness(driver, ScriptedOracle::new());
        let mut live = live_plan(&h, vec![Action::Click { index: 0 }, Action::Click { index: 1 }]).await;
        let report = run(&h, &mut live).await;
        assert!(matches!(report.outcome, RunOutcome::ActionFailed { index: Some(0), .. }));
        assert_eq!(h.driver.performed().len(), 1);
    }

    #[tokio::test]
    async fn test_replan_cap_abandons_plan() {
        let h = harness(page(vec![button("Compose")]), ScriptedOracle::new());
        let mut live = live_plan(&h, vec![Action::Click { index: 0 }]).await;
        live.replans = h.runner.settings().max_replans_per_plan;

        let task_id = task();
        let session = session();
        let scope = RunScope {
            task_id: &task_id,
            session: &session,
            step: 1,
        };
        let resolution = h
            .runner
            .replan(&scope, &mut live, "modal", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, ReplanResolution::Abandoned { .. }));
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_replan_readmits_remaining() {
        let oracle = ScriptedOracle::new().reply(
            AgentRole::Planner,
            r#"{"needsReplanning": false, "analysis": "still valid", "executionMode": "single_step", "updatedPlan": [], "reasoning": "nothing moved"}"#,
        );
        let h = harness(page(vec![button("Compose"), button("Send")]), oracle);
        let mut live = live_plan(&h, vec![Action::Click { index: 1 }]).await;

        let task_id = task();
        let session = session();
        let scope = RunScope {
            task_id: &task_id,
            session: &session,
            step: 1,
        };
        let resolution = h
            .runner
            .replan(&scope, &mut live, "stale", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolution, ReplanResolution::Readmitted);
        assert_eq!(live.remaining(), vec![Action::Click { index: 1 }]);
        assert_eq!(live.replans(), 1);
    }

    #[tokio::test]
    async fn test_malformed_replan_keeps_remaining_actions() {
        let oracle = ScriptedOracle::new().reply(AgentRole::Planner, "sorry, I cannot help with that");
        let h = harness(page(vec![button("Compose"), button("Send")]), oracle);
        let mut live = live_plan(&h, vec![Action::Click { index: 1 }]).await;

        let task_id = task();
        let session = session();
        let scope = RunScope {
            task_id: &task_id,
            session: &session,
            step: 1,
        };
        let resolution = h
            .runner
            .replan(&scope, &mut live, "modal", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolution, ReplanResolution::Readmitted);
        assert_eq!(live.remaining(), vec![Action::Click { index: 1 }]);

        // Kept actions are re-resolved before they run
        let report = run(&h, &mut live).await;
        assert!(matches!(report.outcome, RunOutcome::Exhausted));
        assert_eq!(h.driver.performed(), vec![Action::Click { index: 1 }]);
    }
}
