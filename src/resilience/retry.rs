//! Retry with exponential backoff

use crate::context::{keys, ExecutionContext};
use crate::error::{Result, RuntimeError};
use crate::metrics::Metrics;
use crate::middleware::{Middleware, Next};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "retry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub priority: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            priority: 150,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

type RetryPredicate = dyn Fn(&RuntimeError) -> bool + Send + Sync;

pub struct RetryMiddleware {
    config: RetryConfig,
    retry_if: Arc<RetryPredicate>,
    metrics: Option<Arc<Metrics>>,
}

impl RetryMiddleware {
    /// By default every error except rejected input is retried.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_if: Arc::new(|e| !e.is_validation()),
            metrics: None,
        }
    }

    pub fn with_retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RuntimeError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    async fn handle(
        &self,
        envelope: &Envelope,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<()> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match next.run(envelope, ctx).await {
                Ok(()) => {
                    if attempt > 1 {
                        ctx.set(keys::RETRY_COUNT, attempt - 1);
                    }
                    return Ok(());
                }
                Err(e) if attempt < max_attempts && (self.retry_if)(&e) => {
                    let delay = self.config.delay_for(attempt);
                    debug!(
                        operation = ctx.operation(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    ctx.clear_response();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
