//! Core type definitions for task execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SettingsProvider;

/// Task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Environment session identifier (one live document per session)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Planning,
    Executing,
    Validating,
    Replanning,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Validating => write!(f, "validating"),
            Self::Replanning => write!(f, "replanning"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "validating" => Ok(Self::Validating),
            "replanning" => Ok(Self::Replanning),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// One end-to-end automation goal with bounded steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal: String,
    pub session_id: SessionId,
    pub status: TaskStatus,
    /// Monotonic, never exceeds `max_steps`
    pub step_count: u32,
    pub max_steps: u32,
    pub max_failures: u32,
    pub planning_interval: u32,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>, session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            goal: goal.into(),
            session_id,
            status: TaskStatus::Pending,
            step_count: 0,
            max_steps: 100,
            max_failures: 3,
            planning_interval: 1,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Copy limits from a settings provider
    pub fn with_limits(mut self, settings: &dyn SettingsProvider) -> Self {
        self.max_steps = settings.max_steps();
        self.max_failures = settings.max_failures();
        self.planning_interval = settings.planning_interval();
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_planning_interval(mut self, interval: u32) -> Self {
        self.planning_interval = interval.max(1);
        self
    }

    pub fn steps_remaining(&self) -> u32 {
        self.max_steps.saturating_sub(self.step_count)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Scroll direction for scroll actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// One discrete operation, valid only against the snapshot it was planned on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        index: usize,
    },
    InputText {
        index: usize,
        text: String,
    },
    SelectOption {
        index: usize,
        option: String,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default)]
        amount: Option<u32>,
    },
    Navigate {
        url: String,
    },
    SendKeys {
        keys: String,
    },
    Wait {
        ms: u64,
    },
    Done {
        success: bool,
        #[serde(default)]
        text: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::InputText { .. } => ActionKind::InputText,
            Self::SelectOption { .. } => ActionKind::SelectOption,
            Self::Scroll { .. } => ActionKind::Scroll,
            Self::Navigate { .. } => ActionKind::Navigate,
            Self::SendKeys { .. } => ActionKind::SendKeys,
            Self::Wait { .. } => ActionKind::Wait,
            Self::Done { .. } => ActionKind::Done,
        }
    }

    /// Element index this action targets, if any
    pub fn target_index(&self) -> Option<usize> {
        match self {
            Self::Click { index } | Self::InputText { index, .. } | Self::SelectOption { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }

    /// Same action retargeted at another index (no-op for untargeted actions)
    pub fn with_index(&self, new_index: usize) -> Self {
        match self {
            Self::Click { .. } => Self::Click { index: new_index },
            Self::InputText { text, .. } => Self::InputText {
                index: new_index,
                text: text.clone(),
            },
            Self::SelectOption { option, .. } => Self::SelectOption {
                index: new_index,
                option: option.clone(),
            },
            other => other.clone(),
        }
    }

    pub fn is_dynamic_trigger(&self) -> bool {
        self.kind().is_dynamic_trigger()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Short human-readable description for history and prompts
    pub fn describe(&self) -> String {
        match self {
            Self::Click { index } => format!("click element {}", index),
            Self::InputText { index, text } => format!("input '{}' into element {}", text, index),
            Self::SelectOption { index, option } => {
                format!("select '{}' in element {}", option, index)
            }
            Self::Scroll { direction, amount } => match amount {
                Some(px) => format!("scroll {} {}px", direction, px),
                None => format!("scroll {} one page", direction),
            },
            Self::Navigate { url } => format!("navigate to {}", url),
            Self::SendKeys { keys } => format!("send keys {}", keys),
            Self::Wait { ms } => format!("wait {}ms", ms),
            Self::Done { success, text } => format!("done (success={}): {}", success, text),
        }
    }
}

/// Fieldless discriminant of [`Action`], used for history keys and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    InputText,
    SelectOption,
    Scroll,
    Navigate,
    SendKeys,
    Wait,
    Done,
}

impl ActionKind {
    /// Kinds that commonly cause the page to grow new interactive structure
    pub fn is_dynamic_trigger(&self) -> bool {
        matches!(self, Self::Click | Self::InputText | Self::SelectOption)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Click => write!(f, "click"),
            Self::InputText => write!(f, "input_text"),
            Self::SelectOption => write!(f, "select_option"),
            Self::Scroll => write!(f, "scroll"),
            Self::Navigate => write!(f, "navigate"),
            Self::SendKeys => write!(f, "send_keys"),
            Self::Wait => write!(f, "wait"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "click" | "click_element" => Ok(Self::Click),
            "input_text" | "input" | "type" => Ok(Self::InputText),
            "select_option" | "select" => Ok(Self::SelectOption),
            "scroll" => Ok(Self::Scroll),
            "navigate" | "go_to_url" => Ok(Self::Navigate),
            "send_keys" | "keys" => Ok(Self::SendKeys),
            "wait" => Ok(Self::Wait),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid action kind: {}", s)),
        }
    }
}

/// How the runner executes a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Batch,
    #[serde(alias = "single-step", alias = "singleStep", alias = "single")]
    SingleStep,
    /// Let the runner decide from plan content and environment
    #[default]
    Adaptive,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::SingleStep => write!(f, "single_step"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "batch" => Ok(Self::Batch),
            "single_step" | "singlestep" | "single" => Ok(Self::SingleStep),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// Ordered actions serving one goal
///
/// Immutable once handed to the runner, except through a replanner splice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    pub goal: String,
    pub actions: Vec<Action>,
    pub mode: ExecutionMode,
    /// Cache generation of the snapshot the indices were computed against
    pub basis_generation: u64,
}

impl ActionPlan {
    pub fn new(goal: impl Into<String>, actions: Vec<Action>, mode: ExecutionMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            actions,
            mode,
            basis_generation: 0,
        }
    }

    pub fn with_basis(mut self, generation: u64) -> Self {
        self.basis_generation = generation;
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn dynamic_trigger_count(&self) -> usize {
        self.actions.iter().filter(|a| a.is_dynamic_trigger()).count()
    }
}

/// Outcome of one action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub extracted_content: Option<String>,
    pub error: Option<String>,
    pub is_done: bool,
    /// Retain in the oracle's memory window
    pub include_in_memory: bool,
    /// One-line digest preferred over raw content in compressed history
    pub long_term_memory: Option<String>,
    /// Driver observed structural change while performing the action
    #[serde(default)]
    pub dom_changed: bool,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            include_in_memory: true,
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.extracted_content = Some(content.into());
        self
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            include_in_memory: true,
            ..Default::default()
        }
    }

    pub fn done(success: bool, text: impl Into<String>) -> Self {
        Self {
            success,
            extracted_content: Some(text.into()),
            is_done: true,
            include_in_memory: true,
            ..Default::default()
        }
    }

    pub fn with_memory(mut self, line: impl Into<String>) -> Self {
        self.long_term_memory = Some(line.into());
        self
    }

    pub fn with_dom_changed(mut self, changed: bool) -> Self {
        self.dom_changed = changed;
        self
    }

    pub fn excluded_from_memory(mut self) -> Self {
        self.include_in_memory = false;
        self
    }

    /// Line used when this result is folded into history
    pub fn memory_line(&self) -> Option<&str> {
        self.long_term_memory
            .as_deref()
            .or(self.error.as_deref())
            .or(self.extracted_content.as_deref())
    }
}

/// An executed action with its result, as kept in task history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub action: Action,
    pub result: ActionResult,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(step: u32, action: Action, result: ActionResult) -> Self {
        Self {
            step,
            action,
            result,
            timestamp: Utc::now(),
        }
    }
}
