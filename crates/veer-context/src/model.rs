//! Shared context data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use veer_core::{Action, ActionKind, ActionRecord, TaskId, TokenEstimator};

use crate::roles::AgentRole;

/// What a history message describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "action", rename_all = "snake_case")]
pub enum MessageKind {
    Action(ActionKind),
    Navigation,
    Error,
    Observation,
    /// Produced by compression; never summarized again
    Summary,
}

/// One entry of action history as seen by the oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub step: Option<u32>,
}

impl HistoryMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            step: None,
        }
    }

    pub fn at_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Summary, content)
    }

    pub fn is_summary(&self) -> bool {
        self.kind == MessageKind::Summary
    }

    pub fn tokens(&self) -> usize {
        TokenEstimator::estimate(&self.content)
    }

    /// Convert an executed action into a history message.
    ///
    /// Returns `None` for results excluded from memory.
    pub fn from_record(record: &ActionRecord) -> Option<Self> {
        if !record.result.include_in_memory {
            return None;
        }
        let step = record.step;
        let message = if !record.result.success {
            let error = record.result.error.as_deref().unwrap_or("unknown error");
            Self::new(
                MessageKind::Error,
                format!("step {}: {} failed: {}", step, record.action.describe(), error),
            )
        } else if let Action::Navigate { url } = &record.action {
            Self::new(MessageKind::Navigation, format!("step {}: opened {}", step, url))
        } else {
            let line = record
                .result
                .long_term_memory
                .clone()
                .unwrap_or_else(|| record.action.describe());
            Self::new(
                MessageKind::Action(record.action.kind()),
                format!("step {}: {}", step, line),
            )
        };
        Some(message.at_step(step))
    }
}

/// A high-importance element kept in compressed context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyElement {
    pub index: usize,
    pub tag: String,
    pub role: Option<String>,
    pub label: Option<String>,
    pub score: f64,
}

impl KeyElement {
    pub fn render(&self) -> String {
        let mut line = format!("[{}] <{}", self.index, self.tag);
        if let Some(role) = &self.role {
            line.push_str(&format!(" role={}", role));
        }
        line.push('>');
        if let Some(label) = &self.label {
            line.push_str(&format!(" {}", label));
        }
        line
    }
}

/// Snapshot reduced to its important elements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedEnvironment {
    pub url: String,
    pub title: String,
    pub key_elements: Vec<KeyElement>,
    pub total_elements: usize,
    pub generation: u64,
}

impl CompressedEnvironment {
    pub fn tokens(&self) -> usize {
        TokenEstimator::estimate(&self.url)
            + TokenEstimator::estimate(&self.title)
            + self
                .key_elements
                .iter()
                .map(|e| TokenEstimator::estimate(&e.render()))
                .sum::<usize>()
    }
}

/// Frequency and success rate of one action kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStat {
    pub count: u32,
    pub successes: u32,
}

impl ActionStat {
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.successes as f64 / self.count as f64
        }
    }
}

/// A failed action kept for the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub step: u32,
    pub action: String,
    pub error: String,
}

/// Action history reduced to recent messages, patterns and failures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedHistory {
    pub messages: Vec<HistoryMessage>,
    pub patterns: BTreeMap<ActionKind, ActionStat>,
    pub failures: Vec<FailureNote>,
    pub total_actions: usize,
}

impl CompressedHistory {
    pub fn message_tokens(&self) -> usize {
        self.messages.iter().map(HistoryMessage::tokens).sum()
    }

    /// Tokens of everything except the messages
    pub fn aux_tokens(&self) -> usize {
        let failures: usize = self
            .failures
            .iter()
            .map(|f| TokenEstimator::estimate(&f.action) + TokenEstimator::estimate(&f.error))
            .sum();
        failures + self.patterns.len() * 6
    }
}

/// Per-task state shared by the planner, navigator and validator roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub task_id: TaskId,
    pub goal: String,
    pub environment: CompressedEnvironment,
    pub history: CompressedHistory,
    pub scratch: BTreeMap<AgentRole, Vec<String>>,
    /// History was reduced to fit the budget
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub version: u64,
}

impl SharedContext {
    pub fn new(task_id: TaskId, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            goal: goal.into(),
            environment: CompressedEnvironment::default(),
            history: CompressedHistory::default(),
            scratch: BTreeMap::new(),
            compressed: false,
            created_at: now,
            updated_at: now,
            last_access: now,
            access_count: 0,
            version: 0,
        }
    }

    pub fn scratch_for(&self, role: AgentRole) -> &[String] {
        self.scratch.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn estimated_tokens(&self) -> usize {
        let scratch: usize = self
            .scratch
            .values()
            .flatten()
            .map(|s| TokenEstimator::estimate(s))
            .sum();
        self.environment.tokens() + self.history.message_tokens() + self.history.aux_tokens() + scratch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::ActionResult;

    #[test]
    fn test_from_record_prefers_memory_line() {
        let record = ActionRecord::new(
            3,
            Action::InputText {
                index: 5,
                text: "bob".to_string(),
            },
            ActionResult::ok().with_memory("typed 'bob' into To; suggestion list: yes"),
        );
        let message = HistoryMessage::from_record(&record).unwrap();
        assert_eq!(message.kind, MessageKind::Action(ActionKind::InputText));
        assert_eq!(message.content, "step 3: typed 'bob' into To; suggestion list: yes");
        assert_eq!(message.step, Some(3));
    }

    #[test]
    fn test_from_record_failures_and_exclusions() {
        let failed = ActionRecord::new(
            1,
            Action::Click { index: 9 },
            ActionResult::failure("element 9 not found"),
        );
        let message = HistoryMessage::from_record(&failed).unwrap();
        assert_eq!(message.kind, MessageKind::Error);
        assert!(message.content.contains("element 9 not found"));

        let hidden = ActionRecord::new(2, Action::Wait { ms: 10 }, ActionResult::ok().excluded_from_memory());
        assert!(HistoryMessage::from_record(&hidden).is_none());
    }

    #[test]
    fn test_message_kind_serde() {
        let json = serde_json::to_value(MessageKind::Action(ActionKind::Click)).unwrap();
        assert_eq!(json["kind"], "action");
        assert_eq!(json["action"], "click");
    }

    #[test]
    fn test_key_element_render() {
        let element = KeyElement {
            index: 4,
            tag: "input".to_string(),
            role: Some("combobox".to_string()),
            label: Some("To".to_string()),
            score: 7.0,
        };
        assert_eq!(element.render(), "[4] <input role=combobox> To");
    }
}
