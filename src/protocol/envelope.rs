//! Protocol message units exchanged between transports and the dispatcher.

use crate::error::{ErrorKind, FieldError, RuntimeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Error,
    Event,
}

/// Error payload of an `Error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i64,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Builds the user-visible payload for an error. Internal failures are
    /// reported generically; their detail only reaches the server log.
    pub fn from_error(error: &RuntimeError) -> Self {
        let kind = error.kind();
        match error {
            RuntimeError::InvalidParams { message, fields } => {
                let mut info = Self::new(kind, format!("Invalid params: {message}"));
                if !fields.is_empty() {
                    info.data = Some(serde_json::json!({ "fields": fields }));
                }
                info
            }
            _ if kind == ErrorKind::InternalError => Self::new(kind, "Internal error"),
            RuntimeError::Plugin(_) => {
                Self::new(kind, format!("Plugin operation failed ({kind:?})"))
            }
            _ => Self::new(kind, error.to_string()),
        }
    }

    pub fn field_errors(&self) -> Vec<FieldError> {
        self.data
            .as_ref()
            .and_then(|d| d.get("fields"))
            .and_then(|f| serde_json::from_value(f.clone()).ok())
            .unwrap_or_default()
    }
}

/// A protocol message: request, response, error or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Envelope {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn event(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Option<String>, result: Value) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == EnvelopeKind::Request
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// Checks the shape invariants of each envelope kind.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        match self.kind {
            EnvelopeKind::Request => {
                if self.method.as_deref().map_or(true, str::is_empty) {
                    return Err(RuntimeError::InvalidRequest(
                        "request is missing 'method'".into(),
                    ));
                }
                if self.id.is_none() {
                    return Err(RuntimeError::InvalidRequest("request is missing 'id'".into()));
                }
            }
            EnvelopeKind::Event => {
                if self.method.is_none() {
                    return Err(RuntimeError::InvalidRequest("event is missing 'method'".into()));
                }
                if self.id.is_some() {
                    return Err(RuntimeError::InvalidRequest("event must not carry an 'id'".into()));
                }
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                if self.id.is_none() {
                    return Err(RuntimeError::InvalidRequest(format!(
                        "{:?} envelope is missing 'id'",
                        self.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_requires_method() {
        let mut env = Envelope::request("1", "ping", None);
        assert!(env.validate().is_ok());
        env.method = None;
        let err = env.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_event_without_id() {
        let mut env = Envelope::event("notifications/progress", None);
        assert!(env.validate().is_ok());
        env.id = Some("7".into());
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let err = RuntimeError::Internal("/srv/secret/path exploded".into());
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.kind, ErrorKind::InternalError);
        assert!(!info.message.contains("/srv/secret"));
    }

    #[test]
    fn test_invalid_params_carry_fields() {
        let err = RuntimeError::InvalidParams {
            message: "input failed schema validation".into(),
            fields: vec![FieldError {
                path: "/text".into(),
                message: "\"text\" is a required property".into(),
            }],
        };
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.code, -32602);
        assert_eq!(info.field_errors().len(), 1);
        assert_eq!(info.data.unwrap()["fields"][0]["path"], json!("/text"));
    }

    #[test]
    fn test_serialization_shape() {
        let env = Envelope::response(Some("1".into()), json!({"text": "hi"}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"kind": "response", "id": "1", "result": {"text": "hi"}}));
    }
}
