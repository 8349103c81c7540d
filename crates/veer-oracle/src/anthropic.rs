//! Anthropic Messages API oracle
//!
//! Each call is stateless: everything the model needs is in the prompt built
//! from the shared context. Retries and timeouts belong to [`GuardedOracle`];
//! this client only maps HTTP outcomes onto error kinds and keeps its own
//! circuit breaker.
//!
//! [`GuardedOracle`]: crate::GuardedOracle

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};
use veer_core::config::OracleSettings;
use veer_core::{Result, VeerError};

use crate::auth;
use crate::circuit_breaker::CircuitBreaker;
use crate::oracle::{DecisionOracle, OracleReply, OracleRequest, Usage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// HTTP client for the Anthropic Messages API
pub struct AnthropicOracle {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    endpoint: String,
    breaker: CircuitBreaker,
}

impl AnthropicOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            endpoint: ANTHROPIC_API_URL.to_string(),
            breaker: CircuitBreaker::default(),
        }
    }

    /// Build from `[oracle]` settings, reading the key from the environment
    pub fn from_settings(settings: &OracleSettings) -> Result<Self> {
        let key = auth::api_key(&settings.api_key_env)?;
        Ok(Self::new(key, settings.model.clone()).with_max_tokens(settings.max_tokens))
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> VeerError {
        let message = format!("Anthropic API error {}: {}", status, body);
        match status.as_u16() {
            401 | 403 => VeerError::Auth(message),
            429 => VeerError::ApiLimit(message),
            s if s >= 500 => VeerError::Oracle(message),
            _ => VeerError::Other(message),
        }
    }
}

#[async_trait]
impl DecisionOracle for AnthropicOracle {
    #[instrument(skip(self, request), fields(model = %self.model, role = %request.role))]
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleReply> {
        if !self.breaker.can_execute() {
            return Err(VeerError::ApiLimit(format!(
                "Circuit breaker is OPEN after repeated failures. Retry in {} s",
                self.breaker.time_until_retry().as_secs()
            )));
        }

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        debug!("sending request to Anthropic API");
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                VeerError::Oracle(format!("Failed to send request: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "Unknown".to_string());
            let failures = self.breaker.record_failure();
            error!(%status, failures, "oracle request failed");
            return Err(Self::classify_status(status, text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| VeerError::OracleMalformed(format!("Failed to parse response: {}", e)))?;
        self.breaker.record_success();

        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(VeerError::OracleMalformed("No text content in response".to_string()));
        }

        if let Some(usage) = &parsed.usage {
            info!(
                chars = text.len(),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "oracle replied"
            );
        }

        Ok(OracleReply {
            text,
            usage: parsed.usage,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veer_context::AgentRole;

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            AnthropicOracle::classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            VeerError::ApiLimit(_)
        ));
        assert!(matches!(
            AnthropicOracle::classify_status(StatusCode::UNAUTHORIZED, String::new()),
            VeerError::Auth(_)
        ));
        assert!(AnthropicOracle::classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!AnthropicOracle::classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_network() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        let oracle = AnthropicOracle::new("key", "claude-sonnet-4")
            .with_endpoint("http://127.0.0.1:9/unreachable")
            .with_breaker(breaker);

        let err = oracle
            .invoke(&OracleRequest::new(AgentRole::Planner, "s", "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, VeerError::ApiLimit(_)));
    }

    #[test]
    fn test_request_serialization() {
        let body = MessagesRequest {
            model: "claude-sonnet-4",
            max_tokens: 512,
            system: "sys",
            messages: vec![Message {
                role: "user",
                content: "hi",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "sys");
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
