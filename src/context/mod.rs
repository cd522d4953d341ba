//! Per-invocation execution context
//!
//! An `ExecutionContext` is created by the dispatcher for every inbound
//! envelope and threaded mutably through the middleware chain. Middleware uses
//! its metadata map to hand derived state (authenticated user, retry counts,
//! timeout annotations) to the layers below it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::Span;

/// Well-known metadata keys written by the built-in middleware.
pub mod keys {
    pub const RETRY_COUNT: &str = "retryCount";
    pub const TIMEOUT: &str = "timeout";
    pub const TIMEOUT_MS: &str = "timeoutMs";
    pub const BULKHEAD_QUEUED: &str = "bulkheadQueued";
}

/// Typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl ContextValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ContextValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        ContextValue::Int(i64::from(v))
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

impl From<Value> for ContextValue {
    fn from(v: Value) -> Self {
        ContextValue::Json(v)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Transport-scoped client identifier
    pub client_id: String,
    /// Id of the request being served, if any
    pub request_id: Option<String>,
    /// Method of the envelope being served
    pub method: Option<String>,
    /// Tool being invoked, set by `handlers/invoke`
    pub tool_name: Option<String>,
    /// Span all log output for this invocation is attached to
    pub span: Span,
    metadata: HashMap<String, ContextValue>,
    response: Option<Value>,
}

impl ExecutionContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            request_id: None,
            method: None,
            tool_name: None,
            span: Span::none(),
            metadata: HashMap::new(),
            response: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Name used for per-operation policy lookups: the tool if one is being
    /// invoked, otherwise the envelope method.
    pub fn operation(&self) -> &str {
        self.tool_name
            .as_deref()
            .or(self.method.as_deref())
            .unwrap_or("unknown")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.metadata.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.metadata.remove(key)
    }

    pub fn metadata(&self) -> &HashMap<String, ContextValue> {
        &self.metadata
    }

    pub fn retry_count(&self) -> Option<u32> {
        self.get(keys::RETRY_COUNT)
            .and_then(ContextValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn timed_out(&self) -> bool {
        self.get(keys::TIMEOUT)
            .and_then(ContextValue::as_bool)
            .unwrap_or(false)
    }

    /// Stores the result the dispatcher should answer with.
    pub fn set_response(&mut self, result: Value) {
        self.response = Some(result);
    }

    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Value> {
        self.response.take()
    }

    pub fn clear_response(&mut self) {
        self.response = None;
    }
}
