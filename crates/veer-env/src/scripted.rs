//! Deterministic environment driver
//!
//! `ScriptedDriver` keeps an in-memory document per session and mutates it
//! according to rules when actions are performed. Every structural change
//! re-indexes the document (as a real extractor would) and is announced on
//! the mutation bus. Used by tests, replays and the CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use veer_core::{
    Action, ActionKind, ActionResult, ElementNode, EnvironmentSnapshot, Result, SessionId, VeerError,
};

use crate::driver::{EnvironmentDriver, MutationBus, MutationSignal};

/// Which performed actions a rule reacts to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum ActionPattern {
    Any,
    Kind { kind: ActionKind },
    Exact { action: Action },
    /// Action whose target element currently carries this label
    Target {
        #[serde(default)]
        kind: Option<ActionKind>,
        label: String,
    },
}

/// Document change applied when a rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Insert after the element with this label (appends when not found)
    InsertAfter { label: String, elements: Vec<ElementNode> },
    Append { elements: Vec<ElementNode> },
    /// Remove the element at this xpath and everything beneath it
    RemoveSubtree { xpath: String },
    RemoveLabeled { label: String },
    Replace { elements: Vec<ElementNode> },
    Navigate { url: String },
    /// Make the action fail with this message
    Fail { message: String },
}

impl Effect {
    fn is_structural(&self) -> bool {
        !matches!(self, Self::Fail { .. })
    }
}

/// One reaction of the scripted environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: ActionPattern,
    pub effects: Vec<Effect>,
    /// Fire at most this many times (unlimited when absent)
    #[serde(default)]
    pub times: Option<u32>,
    /// Restrict to one session
    #[serde(default)]
    pub session: Option<SessionId>,
}

impl Rule {
    pub fn on(pattern: ActionPattern) -> Self {
        Self {
            pattern,
            effects: Vec::new(),
            times: None,
            session: None,
        }
    }

    /// Shorthand for a rule on an action against a labeled element
    pub fn on_target(kind: ActionKind, label: impl Into<String>) -> Self {
        Self::on(ActionPattern::Target {
            kind: Some(kind),
            label: label.into(),
        })
    }

    pub fn then(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    pub fn in_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

/// Initial page of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub elements: Vec<ElementNode>,
}

/// Serializable description of a whole scripted environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub pages: HashMap<SessionId, ScriptedPage>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct DriverState {
    pages: HashMap<SessionId, ScriptedPage>,
    rules: Vec<Rule>,
    performed: Vec<(SessionId, Action)>,
    snapshot_calls: usize,
}

/// Rule-driven in-memory environment
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    state: Arc<Mutex<DriverState>>,
    bus: MutationBus,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState::default())),
            bus: MutationBus::new(),
        }
    }

    pub fn from_script(script: Script) -> Self {
        let driver = Self::new();
        {
            let mut state = driver.lock();
            for (session, mut page) in script.pages {
                reindex(&mut page.elements);
                state.pages.insert(session, page);
            }
            state.rules = script.rules;
        }
        driver
    }

    pub fn with_page(self, session: SessionId, url: impl Into<String>, elements: Vec<ElementNode>) -> Self {
        {
            let mut state = self.lock();
            let mut elements = elements;
            reindex(&mut elements);
            state.pages.insert(
                session,
                ScriptedPage {
                    url: url.into(),
                    title: String::new(),
                    elements,
                },
            );
        }
        self
    }

    pub fn with_rule(self, rule: Rule) -> Self {
        self.lock().rules.push(rule);
        self
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply a change outside of any action, as an asynchronous page update would
    pub fn inject(&self, session: &SessionId, effect: Effect) {
        let applied = {
            let mut state = self.lock();
            match state.pages.get_mut(session) {
                Some(page) => apply(page, &effect),
                None => false,
            }
        };
        if applied {
            self.bus
                .publish(MutationSignal::new(session.clone(), "injected mutation"));
        }
    }

    /// Every action performed so far, in order
    pub fn performed(&self) -> Vec<Action> {
        self.lock().performed.iter().map(|(_, a)| a.clone()).collect()
    }

    pub fn performed_in(&self, session: &SessionId) -> Vec<Action> {
        self.lock()
            .performed
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub fn snapshot_calls(&self) -> usize {
        self.lock().snapshot_calls
    }

    /// Current document elements of a session
    pub fn elements(&self, session: &SessionId) -> Vec<ElementNode> {
        self.lock()
            .pages
            .get(session)
            .map(|p| p.elements.clone())
            .unwrap_or_default()
    }
}

fn reindex(elements: &mut [ElementNode]) {
    for (i, element) in elements.iter_mut().enumerate() {
        element.index = i;
    }
}

fn label_matches(element: &ElementNode, label: &str) -> bool {
    element
        .label()
        .map(|l| l.eq_ignore_ascii_case(label))
        .unwrap_or(false)
}

fn is_within(element: &ElementNode, xpath: &str) -> bool {
    element.xpath == xpath
        || (element.xpath.starts_with(xpath) && element.xpath[xpath.len()..].starts_with('/'))
}

/// Apply one effect; returns whether the document changed
fn apply(page: &mut ScriptedPage, effect: &Effect) -> bool {
    let changed = match effect {
        Effect::InsertAfter { label, elements } => {
            let at = page
                .elements
                .iter()
                .position(|e| label_matches(e, label))
                .map(|p| p + 1)
                .unwrap_or(page.elements.len());
            for (offset, element) in elements.iter().enumerate() {
                page.elements.insert(at + offset, element.clone());
            }
            !elements.is_empty()
        }
        Effect::Append { elements } => {
            page.elements.extend(elements.iter().cloned());
            !elements.is_empty()
        }
        Effect::RemoveSubtree { xpath } => {
            let before = page.elements.len();
            page.elements.retain(|e| !is_within(e, xpath));
            page.elements.len() != before
        }
        Effect::RemoveLabeled { label } => {
            let before = page.elements.len();
            page.elements.retain(|e| !label_matches(e, label));
            page.elements.len() != before
        }
        Effect::Replace { elements } => {
            page.elements = elements.clone();
            true
        }
        Effect::Navigate { url } => {
            page.url = url.clone();
            true
        }
        Effect::Fail { .. } => false,
    };
    if changed {
        reindex(&mut page.elements);
    }
    changed
}

fn pattern_matches(pattern: &ActionPattern, action: &Action, page: &ScriptedPage) -> bool {
    match pattern {
        ActionPattern::Any => true,
        ActionPattern::Kind { kind } => action.kind() == *kind,
        ActionPattern::Exact { action: expected } => action == expected,
        ActionPattern::Target { kind, label } => {
            if kind.is_some_and(|k| k != action.kind()) {
                return false;
            }
            action
                .target_index()
                .and_then(|i| page.elements.iter().find(|e| e.index == i))
                .map(|e| label_matches(e, label))
                .unwrap_or(false)
        }
    }
}

#[async_trait]
impl EnvironmentDriver for ScriptedDriver {
    async fn snapshot(&self, session: &SessionId) -> Result<EnvironmentSnapshot> {
        let mut state = self.lock();
        state.snapshot_calls += 1;
        let page = state
            .pages
            .get(session)
            .ok_or_else(|| VeerError::Environment(format!("no page for session {}", session)))?;
        Ok(EnvironmentSnapshot::new(session.clone(), page.url.clone(), page.elements.clone())
            .with_title(page.title.clone()))
    }

    async fn perform(&self, session: &SessionId, action: &Action) -> Result<ActionResult> {
        if let Action::Wait { ms } = action {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }

        let (result, mutated) = {
            let mut state = self.lock();
            state.performed.push((session.clone(), action.clone()));

            let DriverState { pages, rules, .. } = &mut *state;
            let page = pages
                .get_mut(session)
                .ok_or_else(|| VeerError::Environment(format!("no page for session {}", session)))?;

            if let Some(index) = action.target_index() {
                if !page.elements.iter().any(|e| e.index == index && e.is_visible) {
                    return Ok(ActionResult::failure(format!("element {} not found", index)));
                }
            }

            let mut effects = Vec::new();
            for rule in rules.iter_mut() {
                if rule.session.as_ref().is_some_and(|s| s != session) {
                    continue;
                }
                if rule.times == Some(0) || !pattern_matches(&rule.pattern, action, page) {
                    continue;
                }
                if let Some(times) = rule.times.as_mut() {
                    *times -= 1;
                }
                effects.extend(rule.effects.iter().cloned());
            }

            if let Some(Effect::Fail { message }) = effects.iter().find(|e| !e.is_structural()) {
                (ActionResult::failure(message.clone()), false)
            } else {
                let mut mutated = false;
                for effect in &effects {
                    mutated |= apply(page, effect);
                }
                let result = match action {
                    Action::Done { success, text } => ActionResult::done(*success, text.clone()),
                    other => ActionResult::ok().with_memory(other.describe()),
                };
                (result.with_dom_changed(mutated), mutated)
            }
        };

        if mutated {
            debug!(session = %session, action = %action.kind(), "scripted document mutated");
            self.bus
                .publish(MutationSignal::new(session.clone(), format!("after {}", action.kind())));
        }
        Ok(result)
    }

    fn subscribe_mutations(&self) -> broadcast::Receiver<MutationSignal> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    fn driver() -> ScriptedDriver {
        ScriptedDriver::new()
            .with_page(
                session(),
                "https://mail.example.com/compose",
                vec![
                    ElementNode::new(0, "input").with_attr("name", "to").with_attr("placeholder", "To"),
                    ElementNode::new(0, "input").with_attr("placeholder", "Subject"),
                ],
            )
            .with_rule(
                Rule::on_target(ActionKind::InputText, "To")
                    .then(Effect::InsertAfter {
                        label: "To".to_string(),
                        elements: vec![ElementNode::new(0, "ul").with_role("listbox")],
                    })
                    .times(1),
            )
    }

    #[tokio::test]
    async fn test_snapshot_is_reindexed() {
        let driver = driver();
        let snap = driver.snapshot(&session()).await.unwrap();
        let indices: Vec<usize> = snap.elements.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(driver.snapshot_calls(), 1);
    }

    #[tokio::test]
    async fn test_rule_mutates_and_publishes() {
        let driver = driver();
        let mut signals = driver.subscribe_mutations();

        let result = driver
            .perform(
                &session(),
                &Action::InputText {
                    index: 0,
                    text: "bob".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.dom_changed);
        assert_eq!(signals.recv().await.unwrap().session_id, session());

        let snap = driver.snapshot(&session()).await.unwrap();
        assert_eq!(snap.elements.len(), 3);
        assert_eq!(snap.elements[1].role(), Some("listbox"));
        assert_eq!(snap.elements[2].label(), Some("Subject"));
        assert_eq!(snap.elements[2].index, 2);
    }

    #[tokio::test]
    async fn test_rule_times_is_respected() {
        let driver = driver();
        let input = Action::InputText {
            index: 0,
            text: "bob".to_string(),
        };
        driver.perform(&session(), &input).await.unwrap();
        let second = driver.perform(&session(), &input).await.unwrap();
        assert!(!second.dom_changed);
        assert_eq!(driver.elements(&session()).len(), 3);
        assert_eq!(driver.performed().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_element_is_failed_result() {
        let driver = driver();
        let result = driver
            .perform(&session(), &Action::Click { index: 17 })
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("element 17 not found"));
    }

    #[tokio::test]
    async fn test_fail_effect() {
        let driver = driver().with_rule(Rule::on(ActionPattern::Kind {
            kind: ActionKind::Navigate,
        })
        .then(Effect::Fail {
            message: "net::ERR_NAME_NOT_RESOLVED".to_string(),
        }));
        let result = driver
            .perform(
                &session(),
                &Action::Navigate {
                    url: "https://nowhere.invalid".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_unknown_session_is_environment_error() {
        let driver = driver();
        let err = driver.snapshot(&SessionId::from("other")).await.unwrap_err();
        assert!(matches!(err, VeerError::Environment(_)));
    }

    #[tokio::test]
    async fn test_inject_publishes() {
        let driver = driver();
        let mut signals = driver.subscribe_mutations();
        driver.inject(
            &session(),
            Effect::RemoveLabeled {
                label: "Subject".to_string(),
            },
        );
        assert!(signals.recv().await.is_ok());
        assert_eq!(driver.elements(&session()).len(), 1);
    }

    #[test]
    fn test_script_deserializes() {
        let script: Script = serde_json::from_str(
            r#"{
                "pages": {
                    "s1": {"url": "https://example.com", "elements": [{"index": 0, "tag": "button", "text": "Go"}]}
                },
                "rules": [
                    {"pattern": {"match": "kind", "kind": "click"},
                     "effects": [{"effect": "navigate", "url": "https://example.com/next"}]}
                ]
            }"#,
        )
        .unwrap();
        let driver = ScriptedDriver::from_script(script);
        assert_eq!(driver.elements(&session()).len(), 1);
    }
}
