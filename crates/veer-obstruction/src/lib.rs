//! # veer-obstruction
//!
//! Recovery from page changes that get between a plan and its next action.
//!
//! - [`ObstructionHandler`] waits out transient overlays and dismisses modal
//!   blockers, recording every attempt
//! - [`ObstructionHistory`] keeps those records per session, optionally on disk
//! - [`PredictiveObstructionDetector`] turns the history into an advisory
//!   forecast the runner uses to pick an execution mode

mod handler;
mod history;
mod predictive;
mod signature;

pub use handler::{HandlingOutcome, ObstructionHandler};
pub use history::ObstructionHistory;
pub use predictive::{ObstructionForecast, PredictiveObstructionDetector};
pub use signature::environment_signature;
