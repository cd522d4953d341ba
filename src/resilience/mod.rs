//! Resilience middleware
//!
//! Four interceptors that protect handler execution. They are ordinary
//! [`Middleware`](crate::middleware::Middleware) and are usually registered on
//! the handler-execution chain, outermost first:
//!
//! | middleware      | default priority |
//! |-----------------|------------------|
//! | circuit breaker | 300              |
//! | bulkhead        | 200              |
//! | retry           | 150              |
//! | timeout         | 100              |
//!
//! With this ordering a timeout applies per attempt, retries happen inside
//! the concurrency slot, and an open circuit rejects before anything queues.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use bulkhead::{BulkheadConfig, BulkheadMiddleware};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState};
pub use retry::{RetryConfig, RetryMiddleware};
pub use timeout::{TimeoutConfig, TimeoutMiddleware};

use crate::metrics::Metrics;
use crate::middleware::MiddlewareChain;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Optional policies; a missing section leaves that middleware out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
}

impl ResilienceConfig {
    pub fn is_empty(&self) -> bool {
        self.timeout.is_none()
            && self.circuit_breaker.is_none()
            && self.retry.is_none()
            && self.bulkhead.is_none()
    }
}

/// Registers every configured policy on `chain`. Returns the names installed.
pub fn install(
    chain: &MiddlewareChain,
    config: &ResilienceConfig,
    metrics: Option<Arc<Metrics>>,
) -> Vec<String> {
    let mut installed = Vec::new();

    if let Some(cfg) = &config.circuit_breaker {
        let mut mw = CircuitBreakerMiddleware::new(cfg.clone());
        if let Some(m) = &metrics {
            mw = mw.with_metrics(m.clone());
        }
        installed.push(cfg.name.clone());
        chain.register(Arc::new(mw));
    }

    if let Some(cfg) = &config.bulkhead {
        let mut mw = BulkheadMiddleware::new(cfg.clone());
        if let Some(m) = &metrics {
            mw = mw.with_metrics(m.clone());
        }
        installed.push(cfg.name.clone());
        chain.register(Arc::new(mw));
    }

    if let Some(cfg) = &config.retry {
        let mut mw = RetryMiddleware::new(cfg.clone());
        if let Some(m) = &metrics {
            mw = mw.with_metrics(m.clone());
        }
        installed.push(retry::NAME.to_string());
        chain.register(Arc::new(mw));
    }

    if let Some(cfg) = &config.timeout {
        let mut mw = TimeoutMiddleware::new(cfg.clone());
        if let Some(m) = &metrics {
            mw = mw.with_metrics(m.clone());
        }
        installed.push(timeout::NAME.to_string());
        chain.register(Arc::new(mw));
    }

    tracing::info!(middleware = ?installed, "Resilience policies installed");
    installed
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::context::ExecutionContext;
    use crate::error::{Result, RuntimeError};
    use crate::middleware::Endpoint;
    use crate::protocol::Envelope;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Endpoint replaying a fixed script of outcomes, then succeeding.
    #[derive(Default)]
    pub struct Scripted {
        outcomes: Mutex<VecDeque<Result<Value>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl Scripted {
        pub fn new(outcomes: Vec<Result<Value>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        pub fn failing(times: usize) -> Self {
            Self::new(
                (0..times)
                    .map(|i| Err(RuntimeError::handler(format!("failure {i}"))))
                    .collect(),
            )
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Endpoint for Scripted {
        async fn call(&self, _envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(Ok(value)) => {
                    ctx.set_response(value);
                    Ok(())
                }
                Some(Err(e)) => Err(e),
                None => {
                    ctx.set_response(json!("ok"));
                    Ok(())
                }
            }
        }
    }

    pub fn request() -> Envelope {
        Envelope::request("1", "handlers/invoke", Some(json!({ "name": "work" })))
    }

    pub fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("test-client");
        ctx.method = Some("handlers/invoke".into());
        ctx.tool_name = Some("work".into());
        ctx
    }
}
