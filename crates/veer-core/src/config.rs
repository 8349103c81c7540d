//! Configuration management for Veer
//!
//! Engine tunables live in `.veer/config.toml`. Every field carries a serde
//! default so a partial file (or no file at all) yields a usable config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Result, VeerError};

/// Engine-wide configuration
///
/// Loaded from `.veer/config.toml` in the working directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VeerConfig {
    /// Per-task limits and cadence
    #[serde(default)]
    pub agent: AgentSettings,

    /// Environment snapshot cache
    #[serde(default)]
    pub cache: CacheSettings,

    /// Change detection scoping
    #[serde(default)]
    pub detector: DetectorSettings,

    /// Adaptive runner thresholds
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Obstruction handling
    #[serde(default)]
    pub obstruction: ObstructionSettings,

    /// Decision oracle transport
    #[serde(default)]
    pub oracle: OracleSettings,

    /// Shared context compression
    #[serde(default)]
    pub context: ContextSettings,
}

/// Task-level limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Consecutive failures before the task fails
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_max_actions_per_step")]
    pub max_actions_per_step: usize,

    /// Invoke the planner every N steps
    #[serde(default = "default_planning_interval")]
    pub planning_interval: u32,

    #[serde(default)]
    pub use_vision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Shared xpath prefix depth counted as "nearby"
    #[serde(default = "default_neighborhood_depth")]
    pub neighborhood_depth: usize,

    /// Maximum centre distance (px) counted as "nearby"
    #[serde(default = "default_proximity_px")]
    pub proximity_px: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Settle time after an action in single-step mode
    #[serde(default = "default_stabilization_ms")]
    pub stabilization_ms: u64,

    /// Dynamic triggers in one plan that force single-step mode
    #[serde(default = "default_dynamic_action_threshold")]
    pub dynamic_action_threshold: usize,

    #[serde(default = "default_max_replans_per_plan")]
    pub max_replans_per_plan: u32,

    /// Predicted obstruction probability that forces single-step mode
    #[serde(default = "default_prediction_threshold")]
    pub prediction_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstructionSettings {
    #[serde(default = "default_stabilize_timeout_ms")]
    pub stabilize_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Labels tried, in order, when dismissing a blocking element
    #[serde(default = "default_dismiss_labels")]
    pub dismiss_labels: Vec<String>,

    /// Key sent when no labeled control dismisses the blocker
    #[serde(default = "default_dismiss_key")]
    pub dismiss_key: String,

    /// Records retained per session
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSettings {
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Estimated tokens allowed in compressed history
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Most recent messages kept verbatim
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent: usize,

    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Messages folded into one summary during aggressive compression
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_key_elements")]
    pub max_key_elements: usize,

    /// Failures surfaced to the planner
    #[serde(default = "default_failure_tail")]
    pub failure_tail: usize,
}

// Default value providers
fn default_max_steps() -> u32 {
    100
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_actions_per_step() -> usize {
    10
}

fn default_planning_interval() -> u32 {
    1
}

fn default_cache_ttl_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    5000
}

fn default_neighborhood_depth() -> usize {
    3
}

fn default_proximity_px() -> f64 {
    240.0
}

fn default_stabilization_ms() -> u64 {
    300
}

fn default_dynamic_action_threshold() -> usize {
    2
}

fn default_max_replans_per_plan() -> u32 {
    3
}

fn default_prediction_threshold() -> f64 {
    0.5
}

fn default_stabilize_timeout_ms() -> u64 {
    1500
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_dismiss_labels() -> Vec<String> {
    ["close", "dismiss", "cancel", "no thanks", "not now", "×", "x"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_dismiss_key() -> String {
    "Escape".to_string()
}

fn default_history_capacity() -> usize {
    50
}

fn default_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_token_budget() -> usize {
    3000
}

fn default_preserve_recent() -> usize {
    5
}

fn default_idle_ttl_secs() -> u64 {
    900
}

fn default_chunk_size() -> usize {
    6
}

fn default_max_key_elements() -> usize {
    40
}

fn default_failure_tail() -> usize {
    5
}

impl VeerConfig {
    /// Load configuration from `.veer/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".veer/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| VeerError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.veer/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".veer");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| VeerError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }
}

/// Read-only access to per-task limits.
///
/// The executor only needs these few knobs, so tests can hand it a bare
/// `AgentSettings` instead of a whole `VeerConfig`.
pub trait SettingsProvider: Send + Sync {
    fn max_steps(&self) -> u32;
    fn max_failures(&self) -> u32;
    fn max_actions_per_step(&self) -> usize;
    fn planning_interval(&self) -> u32;
    fn use_vision(&self) -> bool;
}

impl SettingsProvider for AgentSettings {
    fn max_steps(&self) -> u32 {
        self.max_steps
    }

    fn max_failures(&self) -> u32 {
        self.max_failures
    }

    fn max_actions_per_step(&self) -> usize {
        self.max_actions_per_step
    }

    fn planning_interval(&self) -> u32 {
        self.planning_interval.max(1)
    }

    fn use_vision(&self) -> bool {
        self.use_vision
    }
}

impl SettingsProvider for VeerConfig {
    fn max_steps(&self) -> u32 {
        self.agent.max_steps()
    }

    fn max_failures(&self) -> u32 {
        self.agent.max_failures()
    }

    fn max_actions_per_step(&self) -> usize {
        self.agent.max_actions_per_step()
    }

    fn planning_interval(&self) -> u32 {
        self.agent.planning_interval()
    }

    fn use_vision(&self) -> bool {
        self.agent.use_vision
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl RunnerSettings {
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }
}

impl ObstructionSettings {
    pub fn stabilize_timeout(&self) -> Duration {
        Duration::from_millis(self.stabilize_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl OracleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ContextSettings {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_failures: default_max_failures(),
            max_actions_per_step: default_max_actions_per_step(),
            planning_interval: default_planning_interval(),
            use_vision: false,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            neighborhood_depth: default_neighborhood_depth(),
            proximity_px: default_proximity_px(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            stabilization_ms: default_stabilization_ms(),
            dynamic_action_threshold: default_dynamic_action_threshold(),
            max_replans_per_plan: default_max_replans_per_plan(),
            prediction_threshold: default_prediction_threshold(),
        }
    }
}

impl Default for ObstructionSettings {
    fn default() -> Self {
        Self {
            stabilize_timeout_ms: default_stabilize_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            dismiss_labels: default_dismiss_labels(),
            dismiss_key: default_dismiss_key(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            preserve_recent: default_preserve_recent(),
            idle_ttl_secs: default_idle_ttl_secs(),
            chunk_size: default_chunk_size(),
            max_key_elements: default_max_key_elements(),
            failure_tail: default_failure_tail(),
        }
    }
}
