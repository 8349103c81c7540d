//! Change classification and obstruction records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::ElementNode;
use crate::types::{Action, ActionKind};

/// Classification of the delta between two snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    #[default]
    None,
    /// Cosmetic or attribute-only; safe to ignore
    Minor,
    /// Transient overlay tied to the last action's target
    Interactive,
    /// Modal-like element that must be dismissed first
    Blocking,
}

impl ChangeKind {
    /// Whether this change needs recovery before the plan may continue
    pub fn is_disruptive(&self) -> bool {
        matches!(self, Self::Interactive | Self::Blocking)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Minor => write!(f, "minor"),
            Self::Interactive => write!(f, "interactive"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "minor" => Ok(Self::Minor),
            "interactive" => Ok(Self::Interactive),
            "blocking" => Ok(Self::Blocking),
            _ => Err(format!("Invalid change kind: {}", s)),
        }
    }
}

/// Result of comparing a pre-action and post-action snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeAnalysis {
    pub kind: ChangeKind,
    pub description: String,
    pub new_elements: Vec<ElementNode>,
    pub recommended_actions: Vec<Action>,
    /// Indices of pre-existing elements moved between the snapshots
    pub indices_shifted: bool,
    /// Target element of the action that caused the change
    pub anchor_index: Option<usize>,
}

impl ChangeAnalysis {
    pub fn none() -> Self {
        Self {
            description: "no change".to_string(),
            ..Default::default()
        }
    }

    pub fn new(kind: ChangeKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_new_elements(mut self, elements: Vec<ElementNode>) -> Self {
        self.new_elements = elements;
        self
    }

    pub fn with_recommended(mut self, actions: Vec<Action>) -> Self {
        self.recommended_actions = actions;
        self
    }

    pub fn with_indices_shifted(mut self, shifted: bool) -> Self {
        self.indices_shifted = shifted;
        self
    }

    pub fn with_anchor(mut self, index: Option<usize>) -> Self {
        self.anchor_index = index;
        self
    }
}

/// Recovery strategy attempted against an obstruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Poll until the transient element settles or disappears
    AwaitStabilization,
    /// Click a labeled control inside the blocker
    DismissControl { label: String },
    /// Send a generic dismiss key
    DismissKey { key: String },
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitStabilization => write!(f, "await stabilization"),
            Self::DismissControl { label } => write!(f, "click '{}'", label),
            Self::DismissKey { key } => write!(f, "press {}", key),
        }
    }
}

/// One recovery attempt, kept per session for prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstructionRecord {
    pub kind: ChangeKind,
    pub trigger: Option<Action>,
    pub action_kind: Option<ActionKind>,
    /// Digest of the environment the obstruction appeared in
    pub signature: String,
    pub strategy: ResolutionStrategy,
    pub success: bool,
    #[serde(default)]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ObstructionRecord {
    pub fn new(
        kind: ChangeKind,
        trigger: Option<&Action>,
        signature: impl Into<String>,
        strategy: ResolutionStrategy,
        success: bool,
    ) -> Self {
        Self {
            kind,
            trigger: trigger.cloned(),
            action_kind: trigger.map(Action::kind),
            signature: signature.into(),
            strategy,
            success,
            note: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
