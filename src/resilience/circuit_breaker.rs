//! Circuit breaker
//!
//! Closed counts failures (each success forgives one). Reaching the failure
//! threshold opens the circuit; calls are then rejected without reaching the
//! downstream until the cooldown has elapsed since the last failure. The next
//! call after that is a trial in half-open state, where enough consecutive
//! successes close the circuit and any failure re-opens it.

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::metrics::Metrics;
use crate::middleware::{Middleware, Next};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Cooldown before an open circuit lets a trial call through
    pub timeout_ms: u64,
    pub priority: i32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            priority: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }
}

type ErrorPredicate = dyn Fn(&RuntimeError) -> bool + Send + Sync;

pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    is_error: Arc<ErrorPredicate>,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::closed()),
            is_error: Arc::new(|_| true),
            metrics: None,
        }
    }

    /// Only errors matching `predicate` count as failures. Others pass
    /// through without touching the breaker.
    pub fn with_error_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RuntimeError) -> bool + Send + Sync + 'static,
    {
        self.is_error = Arc::new(predicate);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
    }

    /// Admits or rejects a call, moving Open to HalfOpen once the cooldown
    /// has elapsed.
    fn admit(&self) -> Result<()> {
        let mut st = self.lock();
        if st.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = st.last_failure.map_or(Duration::MAX, |t| t.elapsed());
        let cooldown = self.cooldown();
        if elapsed >= cooldown {
            info!(breaker = %self.config.name, "Circuit half-open, probing");
            st.state = CircuitState::HalfOpen;
            st.success_count = 0;
            return Ok(());
        }

        let remaining = cooldown - elapsed;
        let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Err(RuntimeError::CircuitOpen {
            name: self.config.name.clone(),
            retry_after_secs,
        })
    }

    fn on_success(&self) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.failure_count = st.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.success_threshold {
                    info!(breaker = %self.config.name, "Circuit closed");
                    *st = BreakerState::closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut st = self.lock();
        st.last_failure = Some(Instant::now());
        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.config.name,
                        failures = st.failure_count,
                        "Circuit opened"
                    );
                    st.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.config.name, "Half-open call failed, circuit re-opened");
                st.state = CircuitState::Open;
                st.success_count = 0;
            }
            CircuitState::Open => {
                st.failure_count += 1;
            }
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        &self.config.name
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
        if let Err(rejection) = self.admit() {
            if let Some(metrics) = &self.metrics {
                metrics.record_circuit_rejection();
            }
            return Err(rejection);
        }

        let result = next.run(envelope, ctx).await;
        match &result {
            Ok(()) => self.on_success(),
            Err(e) if (self.is_error)(e) => self.on_failure(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resilience::testing::{context, request, Scripted};

    fn breaker(failure_threshold: u32, timeout_ms: u64) -> Arc<CircuitBreakerMiddleware> {
        Arc::new(CircuitBreakerMiddleware::new(CircuitBreakerConfig {
            name: "api".into(),
            failure_threshold,
            success_threshold: 2,
            timeout_ms,
            ..Default::default()
        }))
    }

    async fn call(cb: &Arc<CircuitBreakerMiddleware>, endpoint: &Scripted) -> Result<()> {
        let chain: Vec<Arc<dyn Middleware>> = vec![cb.clone()];
        Next::new(&chain, endpoint)
            .run(&request(), &mut context())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker(3, 1000);
        let endpoint = Scripted::failing(3);

        for _ in 0..3 {
            let err = call(&cb, &endpoint).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HandlerFailed);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let err = call(&cb, &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.to_string().contains("Retry after 1 seconds"));
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_after_successes() {
        let cb = breaker(3, 1000);
        let endpoint = Scripted::failing(3);
        for _ in 0..3 {
            let _ = call(&cb, &endpoint).await;
        }

        tokio::time::advance(Duration::from_millis(1001)).await;

        call(&cb, &endpoint).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        call(&cb, &endpoint).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 1000);
        let endpoint = Scripted::failing(2);
        let _ = call(&cb, &endpoint).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(call(&cb, &endpoint).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // cooldown restarts from the failed trial call
        let err = call(&cb, &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_forgives_one_failure() {
        let cb = breaker(3, 1000);
        let endpoint = Scripted::new(vec![
            Err(RuntimeError::handler("a")),
            Err(RuntimeError::handler("b")),
            Ok(serde_json::json!(1)),
            Err(RuntimeError::handler("c")),
        ]);

        for _ in 0..4 {
            let _ = call(&cb, &endpoint).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_errors_do_not_trip() {
        let cb = Arc::new(
            CircuitBreakerMiddleware::new(CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            })
            .with_error_predicate(|e| !e.is_validation()),
        );
        let endpoint = Scripted::new(vec![Err(RuntimeError::invalid_params("bad input"))]);

        let err = call(&cb, &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
