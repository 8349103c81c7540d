//! # veer-env
//!
//! Everything between the engine and the live document:
//!
//! - [`EnvironmentDriver`]: the seam to the excluded extraction/dispatch layer,
//!   with mutation signals on a broadcast channel
//! - [`EnvironmentCache`]: per-session snapshot memo with generation counters
//! - [`ChangeDetector`]: classifies the delta a single action caused
//! - [`DynamicityClassifier`]: replaceable "is this page dynamic" strategy
//! - [`ScriptedDriver`]: deterministic driver for tests and replays

pub mod cache;
pub mod detector;
pub mod driver;
pub mod dynamicity;
pub mod scripted;

pub use cache::EnvironmentCache;
pub use detector::{ChangeDetector, SnapshotDiff};
pub use driver::{EnvironmentDriver, MutationBus, MutationSignal};
pub use dynamicity::{DynamicityClassifier, DynamicityScore, FixedClassifier, HeuristicClassifier};
pub use scripted::{ActionPattern, Effect, Rule, Script, ScriptedDriver, ScriptedPage};
