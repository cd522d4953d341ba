use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Metrics {
    registry: Registry,

    // Dispatch metrics
    pub requests_total: IntCounter,
    pub requests_failed: IntCounter,
    pub request_duration: Histogram,

    // Handler metrics
    pub handler_invocations_total: IntCounter,
    pub handler_duration: Histogram,

    // Resilience metrics
    pub timeouts_total: IntCounter,
    pub circuit_rejections_total: IntCounter,
    pub bulkhead_rejections_total: IntCounter,
    pub retries_total: IntCounter,

    // Plugin metrics
    pub active_plugins: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric creation failed");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registration failed");
    counter
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let histogram =
        Histogram::with_opts(HistogramOpts::new(name, help)).expect("metric creation failed");
    registry
        .register(Box::new(histogram.clone()))
        .expect("metric registration failed");
    histogram
}

impl Metrics {
    /// Metric names are static and unique, so creation cannot fail at runtime.
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = counter(
            &registry,
            "mcp_server_requests_total",
            "Total number of dispatched requests",
        );
        let requests_failed = counter(
            &registry,
            "mcp_server_requests_failed_total",
            "Total number of requests answered with an error",
        );
        let request_duration = histogram(
            &registry,
            "mcp_server_request_duration_seconds",
            "Request dispatch duration in seconds",
        );
        let handler_invocations_total = counter(
            &registry,
            "mcp_server_handler_invocations_total",
            "Total number of handler invocations",
        );
        let handler_duration = histogram(
            &registry,
            "mcp_server_handler_duration_seconds",
            "Handler execution duration in seconds",
        );
        let timeouts_total = counter(
            &registry,
            "mcp_server_timeouts_total",
            "Total number of executions abandoned by the timeout middleware",
        );
        let circuit_rejections_total = counter(
            &registry,
            "mcp_server_circuit_rejections_total",
            "Total number of calls rejected by an open circuit",
        );
        let bulkhead_rejections_total = counter(
            &registry,
            "mcp_server_bulkhead_rejections_total",
            "Total number of calls rejected by a bulkhead",
        );
        let retries_total = counter(
            &registry,
            "mcp_server_retries_total",
            "Total number of retry attempts",
        );

        let active_plugins =
            IntGauge::new("mcp_server_active_plugins", "Number of activated plugins")
                .expect("metric creation failed");
        registry
            .register(Box::new(active_plugins.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            requests_total,
            requests_failed,
            request_duration,
            handler_invocations_total,
            handler_duration,
            timeouts_total,
            circuit_rejections_total,
            bulkhead_rejections_total,
            retries_total,
            active_plugins,
        }
    }

    pub fn record_handler(&self, duration: Duration) {
        self.handler_invocations_total.inc();
        self.handler_duration.observe(duration.as_secs_f64());
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.inc();
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections_total.inc();
    }

    pub fn record_bulkhead_rejection(&self) {
        self.bulkhead_rejections_total.inc();
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    pub fn plugin_activated(&self) {
        self.active_plugins.inc();
    }

    pub fn plugin_deactivated(&self) {
        self.active_plugins.dec();
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&self.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.requests_total.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        self.metrics
            .request_duration
            .observe(self.start.elapsed().as_secs_f64());
    }

    pub fn fail(self) {
        self.metrics.requests_failed.inc();
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Arc::new(Metrics::new());
        RequestTimer::new(metrics.clone()).fail();
        metrics.record_retry();

        let text = metrics.render();
        assert!(text.contains("mcp_server_requests_total 1"));
        assert!(text.contains("mcp_server_requests_failed_total 1"));
        assert!(text.contains("mcp_server_retries_total 1"));
    }
}
