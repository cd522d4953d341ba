/// Dispatch path benchmarks: a request through the message chain, the
/// handler chain and schema validation, with and without the resilience
/// suite installed.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mcp_rust_server::protocol::Envelope;
use mcp_rust_server::resilience::{self, ResilienceConfig};
use mcp_rust_server::server::Server;
use mcp_rust_server::tools::{handler_fn, Tool};
use serde_json::{json, Value};
use std::sync::Arc;

fn echo_server() -> Arc<Server> {
    let server = Server::builder().name("bench").build();
    let tool = Tool::new(
        "echo",
        "Echoes text",
        handler_fn(|input: Value, _ctx| async move {
            Ok(json!({ "text": input["text"].clone() }))
        }),
    )
    .with_schema(json!({
        "type": "object",
        "properties": { "text": { "type": "string" } },
        "required": ["text"]
    }))
    .unwrap();
    server.register_handler(tool);
    server
}

fn request() -> Envelope {
    Envelope::request(
        "1",
        "handlers/invoke",
        Some(json!({ "name": "echo", "input": { "text": "hello" } })),
    )
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Dispatch");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let bare = echo_server();
    group.bench_function("ping", |b| {
        b.to_async(&rt).iter(|| async {
            let reply = bare
                .handle_envelope("bench", black_box(Envelope::request("1", "ping", None)))
                .await;
            black_box(reply)
        });
    });

    group.bench_function("invoke_bare", |b| {
        b.to_async(&rt).iter(|| async {
            let reply = bare.handle_envelope("bench", black_box(request())).await;
            black_box(reply)
        });
    });

    let guarded = echo_server();
    let config: ResilienceConfig = serde_json::from_value(json!({
        "timeout": {},
        "circuitBreaker": {},
        "retry": {},
        "bulkhead": {}
    }))
    .unwrap();
    resilience::install(guarded.handler_chain(), &config, Some(guarded.metrics().clone()));

    group.bench_function("invoke_with_resilience", |b| {
        b.to_async(&rt).iter(|| async {
            let reply = guarded.handle_envelope("bench", black_box(request())).await;
            black_box(reply)
        });
    });

    group.bench_function("invoke_invalid_input", |b| {
        b.to_async(&rt).iter(|| async {
            let envelope = Envelope::request(
                "1",
                "handlers/invoke",
                Some(json!({ "name": "echo", "input": { "text": 42 } })),
            );
            let reply = guarded.handle_envelope("bench", black_box(envelope)).await;
            black_box(reply)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
