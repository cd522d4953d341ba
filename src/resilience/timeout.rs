//! Per-operation execution deadline

use crate::context::{keys, ExecutionContext};
use crate::error::{Result, RuntimeError};
use crate::metrics::Metrics;
use crate::middleware::{Middleware, Next};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const NAME: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub default_timeout_ms: u64,
    /// Deadlines keyed by tool name or method
    pub overrides: HashMap<String, u64>,
    pub priority: i32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            overrides: HashMap::new(),
            priority: 100,
        }
    }
}

pub struct TimeoutMiddleware {
    config: TimeoutConfig,
    metrics: Option<Arc<Metrics>>,
}

impl TimeoutMiddleware {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deadline for the operation in `ctx`: a tool override wins over a
    /// method override, which wins over the default.
    pub fn deadline_for(&self, ctx: &ExecutionContext) -> Duration {
        let overrides = &self.config.overrides;
        let ms = ctx
            .tool_name
            .as_deref()
            .and_then(|tool| overrides.get(tool))
            .or_else(|| ctx.method.as_deref().and_then(|m| overrides.get(m)))
            .copied()
            .unwrap_or(self.config.default_timeout_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
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
        let deadline = self.deadline_for(ctx);

        // Dropping the inner future on expiry cancels the downstream work.
        let outcome = tokio::time::timeout(deadline, next.run(envelope, ctx)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let operation = ctx.operation().to_string();
                warn!(
                    operation = %operation,
                    timeout_ms = deadline.as_millis() as u64,
                    "Operation timed out"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_timeout();
                }
                ctx.clear_response();
                ctx.set(keys::TIMEOUT, true);
                ctx.set(keys::TIMEOUT_MS, deadline.as_millis() as i64);
                Err(RuntimeError::Timeout {
                    operation,
                    timeout: deadline,
                })
            }
        }
    }
}
