//! Pure state machine for the task lifecycle
//!
//! No I/O and no async: `transition(state, event)` returns the next state and
//! the side effects the executor must carry out.
//!
//! - Terminal states absorb every event unchanged
//! - Invalid transitions from a live state go to Failed (never panic)
//! - Paused remembers whether it interrupted Executing or Replanning

use veer_core::TaskStatus;

/// Live phase a paused task returns to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTo {
    Executing,
    Replanning,
}

/// Task lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Pending,
    Planning,
    Executing,
    Replanning { reason: String },
    Validating { claim: String },
    Paused { resume_to: ResumeTo, reason: Option<String> },
    Completed { summary: String },
    Failed { reason: String },
    Cancelled { reason: String },
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    /// Planner produced a usable plan
    PlanReady { actions: usize },
    /// The live plan is exhausted or a planning cadence/flag is due
    PlanDue { reason: String },
    /// Mandatory sequence break raised by the runner
    SequenceBreak { reason: String },
    /// Replanner spliced or re-admitted the remaining actions
    Replanned,
    /// Replanner could not fix the plan; start over from planning
    ReplanAbandoned { reason: String },
    /// A `done` action claimed completion
    DoneClaimed { claim: String },
    ValidationPassed { summary: String },
    ValidationFailed { reason: String },
    Pause,
    Resume,
    Cancel { reason: String },
    Fail { reason: String },
}

/// Side effects of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    LogActivity { message: String },
    /// Drop the live plan
    ReleasePlan,
    /// Abort whatever oracle call or wait is in flight
    AbortInFlight,
}

impl State {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Pending => TaskStatus::Pending,
            Self::Planning => TaskStatus::Planning,
            Self::Executing => TaskStatus::Executing,
            Self::Replanning { .. } => TaskStatus::Replanning,
            Self::Validating { .. } => TaskStatus::Validating,
            Self::Paused { .. } => TaskStatus::Paused,
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_pausable(&self) -> bool {
        matches!(self, Self::Executing | Self::Replanning { .. })
    }

    /// Reason attached to a terminal (or paused) state
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Completed { summary } => Some(summary),
            Self::Failed { reason } | Self::Cancelled { reason } => Some(reason),
            Self::Replanning { reason } => Some(reason),
            Self::Paused { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }
}

fn log(message: impl Into<String>) -> Effect {
    Effect::LogActivity {
        message: message.into(),
    }
}

/// Pure state transition function
///
/// Deterministic, no side effects, never panics.
pub fn transition(state: State, event: Event) -> (State, Vec<Effect>) {
    if state.is_terminal() {
        return (state, vec![]);
    }

    match (state, event) {
        (_, Event::Cancel { reason }) => (
            State::Cancelled {
                reason: reason.clone(),
            },
            vec![log(format!("Cancelled: {}", reason)), Effect::AbortInFlight, Effect::ReleasePlan],
        ),

        (_, Event::Fail { reason }) => (
            State::Failed {
                reason: reason.clone(),
            },
            vec![log(format!("Failed: {}", reason)), Effect::ReleasePlan],
        ),

        (State::Pending, Event::Start) => (State::Planning, vec![log("Task started")]),

        (State::Planning, Event::PlanReady { actions }) => {
            (State::Executing, vec![log(format!("Plan ready: {} actions", actions))])
        }

        (State::Executing, Event::PlanDue { reason }) => {
            (State::Planning, vec![log(format!("Planning: {}", reason))])
        }

        (State::Executing, Event::SequenceBreak { reason }) => (
            State::Replanning {
                reason: reason.clone(),
            },
            vec![log(format!("Sequence break: {}", reason))],
        ),

        (State::Executing, Event::DoneClaimed { claim }) => (
            State::Validating {
                claim: claim.clone(),
            },
            vec![log(format!("Completion claimed: {}", claim))],
        ),

        (State::Replanning { .. }, Event::Replanned) => {
            (State::Executing, vec![log("Remaining actions replanned")])
        }

        (State::Replanning { .. }, Event::ReplanAbandoned { reason }) => (
            State::Planning,
            vec![log(format!("Replan abandoned: {}", reason)), Effect::ReleasePlan],
        ),

        (State::Validating { .. }, Event::ValidationPassed { summary }) => (
            State::Completed {
                summary: summary.clone(),
            },
            vec![log(format!("Completed: {}", summary)), Effect::ReleasePlan],
        ),

        (State::Validating { .. }, Event::ValidationFailed { reason }) => (
            State::Planning,
            vec![log(format!("Validation failed: {}", reason)), Effect::ReleasePlan],
        ),

        (State::Executing, Event::Pause) => (
            State::Paused {
                resume_to: ResumeTo::Executing,
                reason: None,
            },
            vec![log("Paused while executing")],
        ),

        (State::Replanning { reason }, Event::Pause) => (
            State::Paused {
                resume_to: ResumeTo::Replanning,
                reason: Some(reason),
            },
            vec![log("Paused while replanning")],
        ),

        (State::Paused { resume_to, reason }, Event::Resume) => {
            let next = match resume_to {
                ResumeTo::Executing => State::Executing,
                ResumeTo::Replanning => State::Replanning {
                    reason: reason.unwrap_or_default(),
                },
            };
            (next, vec![log("Resumed")])
        }

        (state, event) => (
            State::Failed {
                reason: format!("Invalid state transition: {:?} cannot handle event {:?}", state, event),
            },
            vec![Effect::ReleasePlan],
        ),
    }
}
