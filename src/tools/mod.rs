//! Handler registry ("tool manager")
//!
//! Tools are name-keyed, schema-validated async operations. Registration may
//! happen at any time (plugins register during activation), so the table is
//! a concurrent map and dispatch clones the tool handle out before invoking.

pub mod validator;

pub use validator::{AcceptAny, InputValidator, JsonSchemaValidator};

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value>;
}

/// Adapter turning an async closure into a [`ToolHandler`]. The closure
/// receives its own copy of the execution context.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        (self.0)(input, ctx.clone()).await
    }
}

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub validator: Arc<dyn InputValidator>,
    pub handler: Arc<dyn ToolHandler>,
    pub metadata: HashMap<String, Value>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            validator: Arc::new(AcceptAny),
            handler: Arc::new(handler),
            metadata: HashMap::new(),
        }
    }

    /// Validates input against a JSON Schema.
    pub fn with_schema(self, schema: Value) -> Result<Self> {
        Ok(self.with_validator(JsonSchemaValidator::new(schema)?))
    }

    pub fn with_validator(mut self, validator: impl InputValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.validator.schema(),
            metadata: self.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Serializable view of a tool, as returned by `handlers/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

#[derive(Default)]
pub struct ToolManager {
    tools: DashMap<String, Arc<Tool>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. An existing tool with the same name is replaced.
    pub fn register(&self, tool: Tool) {
        let name = tool.name.clone();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!(tool = %name, "Tool re-registered, previous definition overwritten");
        } else {
            info!(tool = %name, "Tool registered");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.remove(name).is_some();
        if removed {
            info!(tool = %name, "Tool unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> =
            self.tools.iter().map(|entry| entry.value().descriptor()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Validates `input` and invokes the named tool.
    pub async fn execute(&self, name: &str, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| RuntimeError::HandlerNotFound(name.to_string()))?;

        let violations = tool.validator.validate(&input);
        if !violations.is_empty() {
            debug!(tool = %name, violations = violations.len(), "Tool input rejected");
            return Err(RuntimeError::InvalidParams {
                message: format!("input for '{name}' failed validation"),
                fields: violations,
            });
        }

        tool.handler.invoke(input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn echo() -> Tool {
        Tool::new(
            "echo",
            "Echo the input text",
            handler_fn(|input, _ctx| async move { Ok(json!({ "text": input["text"] })) }),
        )
        .with_schema(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_validates_then_invokes() {
        let manager = ToolManager::new();
        manager.register(echo());
        let ctx = ExecutionContext::new("c");

        let out = manager.execute("echo", json!({"text": "hi"}), &ctx).await.unwrap();
        assert_eq!(out, json!({"text": "hi"}));

        let err = manager.execute("echo", json!({"text": 1}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        match err {
            RuntimeError::InvalidParams { fields, .. } => assert_eq!(fields[0].path, "/text"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let manager = ToolManager::new();
        let err = manager
            .execute("nope", json!({}), &ExecutionContext::new("c"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerNotFound);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let manager = ToolManager::new();
        manager.register(echo());
        manager.register(Tool::new(
            "echo",
            "Replacement",
            handler_fn(|_, _| async { Ok(json!(null)) }),
        ));

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.list()[0].description, "Replacement");
        assert!(manager.unregister("echo"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_descriptor_is_serializable_metadata() {
        let manager = ToolManager::new();
        manager.register(echo().with_metadata("category", json!("demo")));

        let listed = serde_json::to_value(manager.list()).unwrap();
        assert_eq!(listed[0]["name"], json!("echo"));
        assert_eq!(listed[0]["inputSchema"]["required"], json!(["text"]));
        assert_eq!(listed[0]["metadata"]["category"], json!("demo"));
    }
}
