//! API key lookup for the Anthropic oracle

use std::env;
use veer_core::{Result, VeerError};

const DEFAULT_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Resolve the API key.
///
/// Priority:
/// 1. the configured variable (`[oracle] api_key_env`)
/// 2. `ANTHROPIC_API_KEY`
pub fn api_key(configured_env: &str) -> Result<String> {
    let mut candidates = vec![configured_env];
    if configured_env != DEFAULT_KEY_ENV {
        candidates.push(DEFAULT_KEY_ENV);
    }

    for name in candidates {
        match env::var(name) {
            Ok(value) if !value.trim().is_empty() => {
                tracing::debug!("Using API key from {}", name);
                return Ok(value);
            }
            _ => continue,
        }
    }

    Err(VeerError::Auth(format!(
        "No API key found. Set {} (or {})",
        configured_env, DEFAULT_KEY_ENV
    )))
}
