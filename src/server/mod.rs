//! Dispatcher
//!
//! `Server` owns the handler registry, both middleware chains, the hook
//! registry and the catalog providers. Every inbound envelope goes through
//! [`Server::handle_envelope`], which is the outermost failure boundary:
//! errors and panics below it become a single Error envelope.

mod dispatch;

use crate::context::ExecutionContext;
use crate::error::{ErrorKind, Result, RuntimeError, TransportError};
use crate::hooks::{Hook, HookContext, HookPhase, HookRegistry};
use crate::metrics::{Metrics, RequestTimer};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::protocol::{Envelope, ErrorInfo};
use crate::provider::{ContentProvider, ProviderRegistry};
use crate::tools::{Tool, ToolDescriptor, ToolManager};
use crate::transport::{Transport, TransportEvents};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

pub struct Server {
    info: ServerInfo,
    tools: ToolManager,
    middleware: MiddlewareChain,
    handler_middleware: MiddlewareChain,
    hooks: HookRegistry,
    resources: ProviderRegistry,
    prompts: ProviderRegistry,
    transport: Option<Arc<dyn Transport>>,
    running: AtomicBool,
    metrics: Arc<Metrics>,
}

#[derive(Default)]
pub struct ServerBuilder {
    name: Option<String>,
    version: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    metrics: Option<Arc<Metrics>>,
}

impl ServerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<Server> {
        Arc::new(Server {
            info: ServerInfo {
                name: self.name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
                version: self
                    .version
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            },
            tools: ToolManager::new(),
            middleware: MiddlewareChain::new("message"),
            handler_middleware: MiddlewareChain::new("handler"),
            hooks: HookRegistry::new(),
            resources: ProviderRegistry::new("resource"),
            prompts: ProviderRegistry::new("prompt"),
            transport: self.transport,
            running: AtomicBool::new(false),
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // Registration

    pub fn register_handler(&self, tool: Tool) {
        self.tools.register(tool);
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.tools.unregister(name)
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    pub fn list_handlers(&self) -> Vec<ToolDescriptor> {
        self.tools.list()
    }

    /// Adds middleware around method resolution.
    pub fn register_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.register(middleware);
    }

    /// Adds middleware around handler invocation only.
    pub fn register_handler_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.handler_middleware.register(middleware);
    }

    pub fn unregister_middleware(&self, name: &str) -> bool {
        self.middleware.unregister(name)
    }

    pub fn unregister_handler_middleware(&self, name: &str) -> bool {
        self.handler_middleware.unregister(name)
    }

    pub fn message_chain(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn handler_chain(&self) -> &MiddlewareChain {
        &self.handler_middleware
    }

    pub fn register_hook(&self, hook: Hook) {
        self.hooks.register(hook);
    }

    pub fn register_resource_provider(&self, provider: Arc<dyn ContentProvider>) {
        self.resources.register(provider);
    }

    pub fn register_prompt_provider(&self, provider: Arc<dyn ContentProvider>) {
        self.prompts.register(provider);
    }

    // Lifecycle

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(server = %self.info.name, "Server already running");
            return Ok(());
        }

        info!(server = %self.info.name, version = %self.info.version, "Starting server");
        self.hooks.run(HookContext::new(HookPhase::OnStart)).await;

        if let Some(transport) = &self.transport {
            let events: Arc<dyn TransportEvents> = self.clone();
            if let Err(e) = transport.start(events).await {
                self.running.store(false, Ordering::SeqCst);
                error!(error = %e, "Transport failed to start");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops the transport. Calling it while not running only warns.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!(server = %self.info.name, "Stop requested but server is not running");
            return Ok(());
        }

        info!(server = %self.info.name, "Stopping server");
        self.hooks.run(HookContext::new(HookPhase::OnStop)).await;

        if let Some(transport) = &self.transport {
            transport.stop().await?;
        }
        Ok(())
    }

    // Outbound

    pub async fn send(&self, client_id: &str, envelope: Envelope) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.send(client_id, envelope).await,
            None => Err(TransportError::Closed.into()),
        }
    }

    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.broadcast(envelope).await,
            None => Err(TransportError::Unsupported("broadcast").into()),
        }
    }

    // Dispatch

    /// Runs one envelope through the dispatcher. Requests always yield
    /// exactly one Response or Error; other kinds yield nothing.
    pub async fn handle_envelope(&self, client_id: &str, envelope: Envelope) -> Option<Envelope> {
        let span = tracing::info_span!(
            "dispatch",
            client_id = %client_id,
            request_id = envelope.id.as_deref().unwrap_or(""),
            method = envelope.method.as_deref().unwrap_or(""),
        );
        self.dispatch(client_id, envelope, span.clone())
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        client_id: &str,
        envelope: Envelope,
        span: tracing::Span,
    ) -> Option<Envelope> {
        let mut ctx = ExecutionContext::new(client_id).with_span(span);
        ctx.request_id = envelope.id.clone();
        ctx.method = envelope.method.clone();

        let timer = envelope
            .is_request()
            .then(|| RequestTimer::new(self.metrics.clone()));

        let outcome = match envelope.validate() {
            Ok(()) => {
                let router = dispatch::Router { server: self };
                AssertUnwindSafe(self.middleware.execute(&envelope, &mut ctx, &router))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(RuntimeError::Internal(panic_message(panic))))
            }
            Err(e) => Err(e),
        };

        let outcome = match outcome {
            Ok(()) if !envelope.is_request() => return None,
            Ok(()) => ctx
                .take_response()
                .ok_or_else(|| RuntimeError::InvalidRequest("request was not handled".into())),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                if let Some(timer) = timer {
                    timer.finish();
                }
                debug!("Request completed");
                Some(Envelope::response(envelope.id, result))
            }
            Err(e) => {
                if let Some(timer) = timer {
                    timer.fail();
                }
                let info = self.report_failure(&ctx, &e).await;
                envelope
                    .is_request()
                    .then(|| Envelope::error(envelope.id, info))
            }
        }
    }

    async fn report_failure(&self, ctx: &ExecutionContext, e: &RuntimeError) -> ErrorInfo {
        let info = ErrorInfo::from_error(e);
        if e.kind() == ErrorKind::InternalError {
            error!(error = %e, operation = ctx.operation(), "Dispatch failed");
        } else {
            warn!(error = %e, code = info.code, operation = ctx.operation(), "Request failed");
        }

        let mut hook_ctx = HookContext::new(HookPhase::OnError)
            .client(ctx.client_id.clone())
            .request(ctx.request_id.clone())
            .error(info.clone());
        hook_ctx.tool_name = ctx.tool_name.clone();
        self.hooks.run(hook_ctx).await;
        info
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic in dispatch".to_string())
}

#[async_trait]
impl TransportEvents for Server {
    async fn on_connect(&self, client_id: &str) {
        debug!(client_id, "Client connected");
        self.hooks
            .run(HookContext::new(HookPhase::OnConnect).client(client_id))
            .await;
    }

    async fn on_disconnect(&self, client_id: &str) {
        debug!(client_id, "Client disconnected");
        self.hooks
            .run(HookContext::new(HookPhase::OnDisconnect).client(client_id))
            .await;
    }

    async fn on_message(&self, client_id: &str, envelope: Envelope) {
        if let Some(reply) = self.handle_envelope(client_id, envelope).await {
            if let Err(e) = self.send(client_id, reply).await {
                warn!(client_id, error = %e, "Failed to deliver reply");
            }
        }
    }
}
