//! Method resolution
//!
//! [`Router`] is the terminal of the message chain: it answers built-in
//! methods and hands `handlers/invoke` to the handler-execution chain, whose
//! terminal is [`ToolEndpoint`].

use super::Server;
use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::hooks::{HookContext, HookPhase};
use crate::middleware::Endpoint;
use crate::protocol::{methods, Envelope, ErrorInfo};
use crate::tools::ToolManager;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

pub(super) struct Router<'a> {
    pub(super) server: &'a Server,
}

#[async_trait]
impl Endpoint for Router<'_> {
    async fn call(&self, envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<()> {
        if !envelope.is_request() {
            debug!(kind = ?envelope.kind, "No method resolution for non-request envelope");
            return Ok(());
        }

        let method = envelope.method.as_deref().unwrap_or_default();
        let server = self.server;
        let result = match method {
            methods::PING => json!({}),
            methods::HANDLERS_LIST => json!({ "handlers": server.tools.list() }),
            methods::HANDLERS_INVOKE => invoke(server, envelope, ctx).await?,
            methods::RESOURCES_LIST => json!({ "resources": server.resources.list(ctx).await? }),
            methods::RESOURCES_READ => {
                let (uri, provider) = uri_params(envelope)?;
                server.resources.read(uri, provider, ctx).await?
            }
            methods::PROMPTS_LIST => json!({ "prompts": server.prompts.list(ctx).await? }),
            methods::PROMPTS_GET => {
                let (uri, provider) = uri_params(envelope)?;
                server.prompts.read(uri, provider, ctx).await?
            }
            other => return Err(RuntimeError::MethodNotFound(other.to_string())),
        };

        ctx.set_response(result);
        Ok(())
    }
}

fn uri_params(envelope: &Envelope) -> Result<(&str, Option<&str>)> {
    let uri = envelope
        .param("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| RuntimeError::invalid_params("'uri' is required"))?;
    let provider = envelope.param("provider").and_then(Value::as_str);
    Ok((uri, provider))
}

async fn invoke(server: &Server, envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<Value> {
    let name = envelope
        .param("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RuntimeError::invalid_params("'name' is required"))?;
    let input = envelope
        .param("input")
        .cloned()
        .ok_or_else(|| RuntimeError::invalid_params("'input' is required"))?;

    if !server.tools.contains(name) {
        return Err(RuntimeError::HandlerNotFound(name.to_string()));
    }
    ctx.tool_name = Some(name.to_string());

    let hook_ctx = |phase| {
        HookContext::new(phase)
            .client(ctx.client_id.clone())
            .request(ctx.request_id.clone())
            .tool(name)
    };
    let before = hook_ctx(HookPhase::BeforeHandlerExecution);
    let after = hook_ctx(HookPhase::AfterHandlerExecution);

    server.hooks.run(before).await;

    let endpoint = ToolEndpoint {
        tools: &server.tools,
        name,
        input,
    };
    let started = Instant::now();
    let outcome = server
        .handler_middleware
        .execute(envelope, ctx, &endpoint)
        .await
        .and_then(|()| {
            ctx.take_response().ok_or_else(|| {
                RuntimeError::Internal(format!("handler '{name}' produced no result"))
            })
        });
    let elapsed = started.elapsed();
    server.metrics.record_handler(elapsed);

    let after = match &outcome {
        Ok(_) => after.duration(elapsed),
        Err(e) => after.duration(elapsed).error(ErrorInfo::from_error(e)),
    };
    server.hooks.run(after).await;

    outcome
}

/// Terminal of the handler-execution chain. Input is cloned per call so
/// retrying middleware can run it again.
struct ToolEndpoint<'a> {
    tools: &'a ToolManager,
    name: &'a str,
    input: Value,
}

#[async_trait]
impl Endpoint for ToolEndpoint<'_> {
    async fn call(&self, _envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<()> {
        let output = self.tools.execute(self.name, self.input.clone(), ctx).await?;
        ctx.set_response(output);
        Ok(())
    }
}
