//! Deterministic obstruction recovery
//!
//! Interactive changes are waited out: the handler polls until the overlay
//! closes or two consecutive snapshots agree. Blocking changes get an ordered
//! list of dismissal attempts (labeled controls inside the blocker, then the
//! dismiss key). Every attempt is recorded, successful or not.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use veer_core::config::ObstructionSettings;
use veer_core::{
    Action, ChangeAnalysis, ChangeKind, ElementNode, EnvironmentSnapshot, ObstructionRecord,
    ResolutionStrategy, Result, SessionId, VeerError,
};
use veer_env::{ChangeDetector, EnvironmentDriver};

use crate::history::ObstructionHistory;
use crate::signature::environment_signature;

/// What the handler achieved
#[derive(Debug, Clone)]
pub struct HandlingOutcome {
    pub handled: bool,
    /// Attempts made, in order
    pub records: Vec<ObstructionRecord>,
    /// Latest snapshot observed while handling
    pub snapshot: EnvironmentSnapshot,
    pub note: String,
}

impl HandlingOutcome {
    fn trivial(snapshot: EnvironmentSnapshot, note: impl Into<String>) -> Self {
        Self {
            handled: true,
            records: Vec::new(),
            snapshot,
            note: note.into(),
        }
    }
}

enum Attempt {
    Control { element: ElementNode, label: String },
    Key(String),
}

pub struct ObstructionHandler {
    driver: Arc<dyn EnvironmentDriver>,
    history: Arc<ObstructionHistory>,
    detector: ChangeDetector,
    settings: ObstructionSettings,
}

impl ObstructionHandler {
    pub fn new(
        driver: Arc<dyn EnvironmentDriver>,
        history: Arc<ObstructionHistory>,
        detector: ChangeDetector,
        settings: ObstructionSettings,
    ) -> Self {
        Self {
            driver,
            history,
            detector,
            settings,
        }
    }

    pub fn history(&self) -> &Arc<ObstructionHistory> {
        &self.history
    }

    /// Try to recover from the change described by `analysis`.
    ///
    /// `before` is the pre-action snapshot and `after` the one the analysis
    /// was computed from. The interrupted action is never repeated.
    #[instrument(skip_all, fields(session = %session, kind = %analysis.kind))]
    pub async fn handle(
        &self,
        session: &SessionId,
        analysis: &ChangeAnalysis,
        trigger: Option<&Action>,
        before: &EnvironmentSnapshot,
        after: EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<HandlingOutcome> {
        let outcome = match analysis.kind {
            ChangeKind::None | ChangeKind::Minor => HandlingOutcome::trivial(after, analysis.description.clone()),
            ChangeKind::Interactive => self.await_stabilization(session, trigger, before, after, cancel).await?,
            ChangeKind::Blocking => self.dismiss(session, analysis, trigger, after, cancel).await?,
        };

        for record in &outcome.records {
            self.history.record(session, record.clone()).await;
        }
        if outcome.handled {
            info!(attempts = outcome.records.len(), note = %outcome.note, "obstruction handled");
        } else {
            warn!(attempts = outcome.records.len(), note = %outcome.note, "obstruction unresolved");
        }
        Ok(outcome)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(VeerError::TaskCancelled),
            _ = tokio::time::sleep(self.settings.poll_interval()) => Ok(()),
        }
    }

    async fn await_stabilization(
        &self,
        session: &SessionId,
        trigger: Option<&Action>,
        before: &EnvironmentSnapshot,
        after: EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<HandlingOutcome> {
        let signature = environment_signature(&after);
        let deadline = Instant::now() + self.settings.stabilize_timeout();
        let mut previous = after;

        let (handled, note, latest) = loop {
            self.pause(cancel).await?;
            let current = self.driver.snapshot(session).await?;
            let observed = self.detector.analyze(before, &current, trigger);

            match observed.kind {
                ChangeKind::None | ChangeKind::Minor => {
                    break (true, "overlay closed".to_string(), current);
                }
                ChangeKind::Blocking => {
                    break (false, format!("escalated while waiting: {}", observed.description), current);
                }
                ChangeKind::Interactive if same_structure(&previous, &current) => {
                    break (
                        true,
                        format!("{}; settled, indices may have shifted", observed.description),
                        current,
                    );
                }
                ChangeKind::Interactive => {}
            }

            if Instant::now() >= deadline {
                break (false, "overlay did not settle before timeout".to_string(), current);
            }
            debug!("overlay still changing");
            previous = current;
        };

        let record = ObstructionRecord::new(
            ChangeKind::Interactive,
            trigger,
            signature,
            ResolutionStrategy::AwaitStabilization,
            handled,
        )
        .with_note(note.clone());

        Ok(HandlingOutcome {
            handled,
            records: vec![record],
            snapshot: latest,
            note,
        })
    }

    async fn dismiss(
        &self,
        session: &SessionId,
        analysis: &ChangeAnalysis,
        trigger: Option<&Action>,
        after: EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<HandlingOutcome> {
        let signature = environment_signature(&after);
        let Some(modal) = analysis
            .new_elements
            .iter()
            .find(|e| e.is_modal_like())
            .cloned()
        else {
            return Ok(HandlingOutcome {
                handled: false,
                records: Vec::new(),
                snapshot: after,
                note: "no blocking element to dismiss".to_string(),
            });
        };

        let attempts = self.attempts(&after, &modal, &analysis.new_elements);
        let mut records = Vec::with_capacity(attempts.len());
        let mut current = after;

        for attempt in attempts {
            if cancel.is_cancelled() {
                return Err(VeerError::TaskCancelled);
            }

            let (strategy, action) = match attempt {
                Attempt::Control { element, label } => {
                    let strategy = ResolutionStrategy::DismissControl { label };
                    match current.resolve(&element) {
                        Some(resolved) => (strategy, Action::Click { index: resolved.index }),
                        None => {
                            records.push(
                                ObstructionRecord::new(ChangeKind::Blocking, trigger, signature.clone(), strategy, false)
                                    .with_note("control no longer present"),
                            );
                            continue;
                        }
                    }
                }
                Attempt::Key(key) => (
                    ResolutionStrategy::DismissKey { key: key.clone() },
                    Action::SendKeys { keys: key },
                ),
            };

            debug!(attempt = %strategy, "dismissing blocker");
            let result = self.driver.perform(session, &action).await?;
            self.pause(cancel).await?;
            current = self.driver.snapshot(session).await?;

            let cleared = result.success && !still_present(&current, &modal);
            let mut record = ObstructionRecord::new(ChangeKind::Blocking, trigger, signature.clone(), strategy, cleared);
            if let Some(error) = &result.error {
                record = record.with_note(error.clone());
            }
            records.push(record);

            if cleared {
                let note = format!("dismissed after {} attempt(s)", records.len());
                return Ok(HandlingOutcome {
                    handled: true,
                    records,
                    snapshot: current,
                    note,
                });
            }
        }

        let note = format!("{} dismissal attempt(s) failed", records.len());
        Ok(HandlingOutcome {
            handled: false,
            records,
            snapshot: current,
            note,
        })
    }

    /// Ordered dismissal attempts: one per configured label, then the key
    fn attempts(&self, after: &EnvironmentSnapshot, modal: &ElementNode, appeared: &[ElementNode]) -> Vec<Attempt> {
        let inside: Vec<&ElementNode> = if modal.xpath.is_empty() {
            appeared.iter().collect()
        } else {
            after
                .elements
                .iter()
                .filter(|e| e.xpath.starts_with(&modal.xpath) && e.xpath[modal.xpath.len()..].starts_with('/'))
                .collect()
        };
        let controls: Vec<&ElementNode> = inside
            .into_iter()
            .filter(|e| e.is_interactive && e.is_visible)
            .collect();

        let mut attempts = Vec::new();
        let mut used: Vec<usize> = Vec::new();
        for hint in &self.settings.dismiss_labels {
            let hint = hint.trim().to_lowercase();
            if let Some(control) = controls
                .iter()
                .find(|c| !used.contains(&c.index) && c.label().is_some_and(|l| label_matches(l, &hint)))
            {
                used.push(control.index);
                attempts.push(Attempt::Control {
                    element: (*control).clone(),
                    label: control.label().unwrap_or(&hint).to_string(),
                });
            }
        }
        attempts.push(Attempt::Key(self.settings.dismiss_key.clone()));
        attempts
    }
}

fn label_matches(label: &str, hint: &str) -> bool {
    let label = label.trim().to_lowercase();
    if hint.chars().count() <= 1 {
        label == hint
    } else {
        label.contains(hint)
    }
}

fn still_present(snapshot: &EnvironmentSnapshot, modal: &ElementNode) -> bool {
    snapshot
        .find_by_fingerprint(&modal.fingerprint())
        .iter()
        .any(|e| e.is_visible)
}

fn same_structure(a: &EnvironmentSnapshot, b: &EnvironmentSnapshot) -> bool {
    a.url == b.url
        && a.elements.len() == b.elements.len()
        && a.elements
            .iter()
            .zip(&b.elements)
            .all(|(x, y)| x.is_visible == y.is_visible && x.fingerprint() == y.fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::ActionKind;
    use veer_env::{Effect, Rule, ScriptedDriver};

    const MODAL: &str = "/html/body/div[2]";

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    fn settings() -> ObstructionSettings {
        ObstructionSettings {
            stabilize_timeout_ms: 60,
            poll_interval_ms: 5,
            ..ObstructionSettings::default()
        }
    }

    fn compose() -> Vec<ElementNode> {
        vec![
            ElementNode::new(0, "input")
                .with_role("combobox")
                .with_attr("aria-label", "To")
                .with_xpath("/html/body/form/div[1]/input"),
            ElementNode::new(1, "input")
                .with_attr("aria-label", "Subject")
                .with_xpath("/html/body/form/div[2]/input"),
        ]
    }

    fn suggestions() -> Vec<ElementNode> {
        vec![
            ElementNode::new(0, "ul")
                .with_role("listbox")
                .with_xpath("/html/body/form/div[1]/ul")
                .non_interactive(),
            ElementNode::new(0, "li")
                .with_role("option")
                .with_text("bob@example.com")
                .with_xpath("/html/body/form/div[1]/ul/li[1]"),
        ]
    }

    fn modal(buttons: &[&str]) -> Vec<ElementNode> {
        let mut elements = vec![ElementNode::new(0, "div")
            .with_role("dialog")
            .with_attr("aria-label", "Newsletter")
            .with_xpath(MODAL)
            .non_interactive()];
        for (i, label) in buttons.iter().enumerate() {
            elements.push(
                ElementNode::new(0, "button")
                    .with_text(*label)
                    .with_xpath(format!("{}/button[{}]", MODAL, i + 1)),
            );
        }
        elements
    }

    fn with_elements(elements: Vec<ElementNode>) -> EnvironmentSnapshot {
        let mut elements = elements;
        for (i, e) in elements.iter_mut().enumerate() {
            e.index = i;
        }
        EnvironmentSnapshot::new(session(), "https://mail.example/compose", elements)
    }

    fn handler(driver: ScriptedDriver) -> (ObstructionHandler, Arc<ObstructionHistory>) {
        let history = Arc::new(ObstructionHistory::in_memory(50));
        let handler = ObstructionHandler::new(
            Arc::new(driver),
            history.clone(),
            ChangeDetector::default(),
            settings(),
        );
        (handler, history)
    }

    fn typed_to() -> Action {
        Action::InputText {
            index: 0,
            text: "bob".to_string(),
        }
    }

    #[tokio::test]
    async fn test_settled_suggestion_list_is_handled() {
        let mut open: Vec<ElementNode> = compose();
        open.splice(1..1, suggestions());
        let driver = ScriptedDriver::new().with_page(session(), "https://mail.example/compose", open.clone());
        let (handler, history) = handler(driver);

        let before = with_elements(compose());
        let after = with_elements(open);
        let analysis = ChangeDetector::default().analyze(&before, &after, Some(&typed_to()));
        assert_eq!(analysis.kind, ChangeKind::Interactive);

        let outcome = handler
            .handle(&session(), &analysis, Some(&typed_to()), &before, after, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.handled);
        assert!(outcome.note.contains("indices may have shifted"));
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].strategy, ResolutionStrategy::AwaitStabilization);
        assert_eq!(outcome.records[0].action_kind, Some(ActionKind::InputText));
        assert_eq!(history.len(&session()).await, 1);
    }

    #[tokio::test]
    async fn test_closed_overlay_is_handled() {
        let driver = ScriptedDriver::new().with_page(session(), "https://mail.example/compose", compose());
        let (handler, _) = handler(driver);

        let mut open = compose();
        open.splice(1..1, suggestions());
        let before = with_elements(compose());
        let after = with_elements(open);
        let analysis = ChangeDetector::default().analyze(&before, &after, Some(&typed_to()));

        let outcome = handler
            .handle(&session(), &analysis, Some(&typed_to()), &before, after, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.handled);
        assert_eq!(outcome.note, "overlay closed");
    }

    #[tokio::test]
    async fn test_blocking_attempts_follow_label_order() {
        let mut page = compose();
        page.extend(modal(&["Not now", "Close"]));
        let driver = ScriptedDriver::new()
            .with_page(session(), "https://mail.example/compose", page.clone())
            .with_rule(Rule::on_target(ActionKind::Click, "Not now").then(Effect::RemoveSubtree {
                xpath: MODAL.to_string(),
            }));
        let observed = driver.clone();
        let (handler, history) = handler(driver);

        let before = with_elements(compose());
        let after = with_elements(page);
        let click = Action::Click { index: 1 };
        let analysis = ChangeDetector::default().analyze(&before, &after, Some(&click));
        assert_eq!(analysis.kind, ChangeKind::Blocking);

        let outcome = handler
            .handle(&session(), &analysis, Some(&click), &before, after, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.handled);
        let strategies: Vec<String> = outcome.records.iter().map(|r| r.strategy.to_string()).collect();
        assert_eq!(strategies, vec!["click 'Close'", "click 'Not now'"]);
        assert!(!outcome.records[0].success);
        assert!(outcome.records[1].success);
        assert!(!outcome.snapshot.has_modal());
        assert_eq!(history.len(&session()).await, 2);
        assert!(!observed.performed().contains(&click));
    }

    #[tokio::test]
    async fn test_unresolvable_blocker_records_every_attempt() {
        let mut page = compose();
        page.extend(modal(&["Continue"]));
        let driver = ScriptedDriver::new().with_page(session(), "https://mail.example/compose", page.clone());
        let observed = driver.clone();
        let (handler, _) = handler(driver);

        let before = with_elements(compose());
        let after = with_elements(page);
        let analysis = ChangeDetector::default().analyze(&before, &after, None);

        let outcome = handler
            .handle(&session(), &analysis, None, &before, after, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.handled);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(
            outcome.records[0].strategy,
            ResolutionStrategy::DismissKey {
                key: "Escape".to_string()
            }
        );
        assert_eq!(
            observed.performed(),
            vec![Action::SendKeys {
                keys: "Escape".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_minor_is_trivially_handled() {
        let driver = ScriptedDriver::new().with_page(session(), "https://mail.example/compose", compose());
        let (handler, history) = handler(driver);
        let snapshot = with_elements(compose());
        let analysis = ChangeAnalysis::new(ChangeKind::Minor, "banner appeared");
        let outcome = handler
            .handle(&session(), &analysis, None, &snapshot, snapshot.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.handled);
        assert!(outcome.records.is_empty());
        assert_eq!(history.len(&session()).await, 0);
    }
}
