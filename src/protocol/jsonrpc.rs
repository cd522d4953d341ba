//! JSON-RPC 2.0 wire representation of envelopes.

use super::envelope::{Envelope, EnvelopeKind, ErrorInfo};
use crate::error::{ErrorKind, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl JsonRpcId {
    pub fn as_key(&self) -> String {
        match self {
            JsonRpcId::Number(n) => n.to_string(),
            JsonRpcId::String(s) => s.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Untyped JSON-RPC frame; the envelope kind is inferred from which members
/// are present.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JsonRpcFrame {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcFrame {
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let frame: JsonRpcFrame = serde_json::from_str(line)
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        if frame.jsonrpc != "2.0" {
            return Err(TransportError::InvalidFormat(format!(
                "unsupported jsonrpc version '{}'",
                frame.jsonrpc
            )));
        }
        Ok(frame)
    }

    pub fn into_envelope(self) -> Envelope {
        let kind = if self.error.is_some() {
            EnvelopeKind::Error
        } else if self.method.is_none() {
            EnvelopeKind::Response
        } else if self.id.is_some() {
            EnvelopeKind::Request
        } else {
            EnvelopeKind::Event
        };

        Envelope {
            kind,
            id: self.id.map(|id| id.as_key()),
            method: self.method,
            params: self.params,
            result: self.result,
            error: self.error.map(|e| ErrorInfo {
                code: e.code,
                kind: kind_for_code(e.code),
                message: e.message,
                data: e.data,
            }),
        }
    }

    /// Converts an outbound envelope, restoring the caller's original id
    /// representation when known.
    pub fn from_envelope(envelope: Envelope, original_id: Option<JsonRpcId>) -> Self {
        let id = original_id.or_else(|| envelope.id.map(JsonRpcId::String));
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: envelope.method,
            params: envelope.params,
            result: match envelope.kind {
                // A response always carries a result member, even if null.
                EnvelopeKind::Response => Some(envelope.result.unwrap_or(Value::Null)),
                _ => envelope.result,
            },
            error: envelope.error.map(|e| JsonRpcError {
                code: e.code,
                message: e.message,
                data: e.data,
            }),
        }
    }
}

fn kind_for_code(code: i64) -> ErrorKind {
    match code {
        -32600 => ErrorKind::InvalidRequest,
        -32601 => ErrorKind::MethodNotFound,
        -32602 => ErrorKind::InvalidParams,
        -32001 => ErrorKind::HandlerNotFound,
        -32002 => ErrorKind::HandlerFailed,
        -32003 => ErrorKind::NotFound,
        -32004 => ErrorKind::Timeout,
        -32005 => ErrorKind::CircuitOpen,
        -32006 => ErrorKind::BulkheadRejected,
        _ => ErrorKind::InternalError,
    }
}
