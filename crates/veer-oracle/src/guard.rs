//! Timeout, cancellation and bounded retry around an oracle call

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use veer_core::config::OracleSettings;
use veer_core::fail_open::{retry_with_backoff, RetryPolicy};
use veer_core::{Result, VeerError};

use crate::oracle::{DecisionOracle, OracleReply, OracleRequest};

/// An oracle wrapped so every call is abortable, time-bounded and retried
#[derive(Clone)]
pub struct GuardedOracle {
    inner: Arc<dyn DecisionOracle>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl GuardedOracle {
    pub fn new(inner: Arc<dyn DecisionOracle>, timeout: Duration, policy: RetryPolicy) -> Self {
        Self { inner, timeout, policy }
    }

    pub fn from_settings(inner: Arc<dyn DecisionOracle>, settings: &OracleSettings) -> Self {
        Self::new(inner, settings.timeout(), RetryPolicy::from_settings(settings))
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Invoke the oracle.
    ///
    /// A cancellation observed during the await discards whatever the
    /// oracle produced and returns [`VeerError::TaskCancelled`].
    #[instrument(skip(self, request, cancel), fields(oracle = self.inner.name(), role = %request.role))]
    pub async fn invoke(&self, request: &OracleRequest, cancel: &CancellationToken) -> Result<OracleReply> {
        let reply = retry_with_backoff("oracle call", self.policy, cancel, || self.attempt(request, cancel)).await?;
        if cancel.is_cancelled() {
            debug!("discarding oracle reply received after cancellation");
            return Err(VeerError::TaskCancelled);
        }
        Ok(reply)
    }

    async fn attempt(&self, request: &OracleRequest, cancel: &CancellationToken) -> Result<OracleReply> {
        tokio::select! {
            _ = cancel.cancelled() => Err(VeerError::TaskCancelled),
            outcome = tokio::time::timeout(self.timeout, self.inner.invoke(request)) => match outcome {
                Ok(reply) => reply,
                Err(_) => Err(VeerError::OracleTimeout(self.timeout.as_millis() as u64)),
            },
        }
    }
}
