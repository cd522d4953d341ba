use mcp_rust_server::error::{ErrorKind, RuntimeError};
use mcp_rust_server::protocol::Envelope;
use mcp_rust_server::resilience::{self, ResilienceConfig};
use mcp_rust_server::server::Server;
use mcp_rust_server::tools::{handler_fn, Tool};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn server_with(config: Value) -> Arc<Server> {
    let server = Server::builder().name("resilience").build();
    let config: ResilienceConfig = serde_json::from_value(config).unwrap();
    resilience::install(
        server.handler_chain(),
        &config,
        Some(server.metrics().clone()),
    );
    server
}

fn invoke(id: &str, name: &str) -> Envelope {
    Envelope::request(
        id,
        "handlers/invoke",
        Some(json!({ "name": name, "input": {} })),
    )
}

async fn error_kind(server: &Server, id: &str, name: &str) -> Option<ErrorKind> {
    let reply = server.handle_envelope("test", invoke(id, name)).await.unwrap();
    reply.error.map(|e| e.kind)
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhaust_then_circuit_opens() {
    let server = server_with(json!({
        "circuitBreaker": { "failureThreshold": 2, "timeoutMs": 5000 },
        "retry": { "maxAttempts": 2, "initialDelayMs": 10 }
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    server.register_handler(Tool::new(
        "flaky",
        "Always fails",
        handler_fn(move |_input: Value, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(RuntimeError::handler("downstream unavailable")) }
        }),
    ));

    assert_eq!(error_kind(&server, "1", "flaky").await, Some(ErrorKind::HandlerFailed));
    assert_eq!(error_kind(&server, "2", "flaky").await, Some(ErrorKind::HandlerFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // open: rejected before the handler runs
    assert_eq!(error_kind(&server, "3", "flaky").await, Some(ErrorKind::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let metrics = server.metrics();
    assert_eq!(metrics.retries_total.get(), 2);
    assert_eq!(metrics.circuit_rejections_total.get(), 1);

    // cooldown elapses, the half-open trial call goes through
    tokio::time::advance(Duration::from_millis(5000)).await;
    assert_eq!(error_kind(&server, "4", "flaky").await, Some(ErrorKind::HandlerFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    let server = server_with(json!({
        "timeout": { "defaultTimeoutMs": 1000, "overrides": { "quick": 50 } }
    }));
    for name in ["slow", "quick"] {
        server.register_handler(Tool::new(
            name,
            "Sleeps",
            handler_fn(|_input: Value, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!({ "done": true }))
            }),
        ));
    }

    assert_eq!(error_kind(&server, "1", "slow").await, None);

    let reply = server.handle_envelope("test", invoke("2", "quick")).await.unwrap();
    let error = reply.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("50ms"));
    assert_eq!(server.metrics().timeouts_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bulkhead_rejects_when_saturated() {
    let server = server_with(json!({
        "bulkhead": { "maxConcurrent": 1, "maxQueue": 0 }
    }));
    server.register_handler(Tool::new(
        "work",
        "Holds its slot for a while",
        handler_fn(|_input: Value, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("done"))
        }),
    ));

    let (first, second) = tokio::join!(
        server.handle_envelope("a", invoke("1", "work")),
        server.handle_envelope("b", invoke("2", "work")),
    );
    assert_eq!(first.unwrap().result, Some(json!("done")));
    assert_eq!(
        second.unwrap().error.map(|e| e.kind),
        Some(ErrorKind::BulkheadRejected)
    );
    assert_eq!(server.metrics().bulkhead_rejections_total.get(), 1);

    // the slot is free again afterwards
    assert_eq!(error_kind(&server, "3", "work").await, None);
}
