use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error taxonomy surfaced to callers through error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    HandlerNotFound,
    HandlerFailed,
    NotFound,
    Timeout,
    CircuitOpen,
    BulkheadRejected,
    InvalidManifest,
    EntryNotFound,
    UnsupportedIntegrityAlgorithm,
    IntegrityCheckFailed,
    CircularDependency,
    InvalidPluginModule,
    PluginNotFound,
    Unsupported,
    InternalError,
}

impl ErrorKind {
    /// Numeric code carried on the wire. Standard JSON-RPC codes where one
    /// exists, server-defined codes otherwise.
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
            ErrorKind::HandlerNotFound => -32001,
            ErrorKind::HandlerFailed => -32002,
            ErrorKind::NotFound => -32003,
            ErrorKind::Timeout => -32004,
            ErrorKind::CircuitOpen => -32005,
            ErrorKind::BulkheadRejected => -32006,
            ErrorKind::Unsupported => -32007,
            ErrorKind::InvalidManifest => -32010,
            ErrorKind::EntryNotFound => -32011,
            ErrorKind::UnsupportedIntegrityAlgorithm => -32012,
            ErrorKind::IntegrityCheckFailed => -32013,
            ErrorKind::CircularDependency => -32014,
            ErrorKind::InvalidPluginModule => -32015,
            ErrorKind::PluginNotFound => -32016,
        }
    }
}

/// A single input validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {message}")]
    InvalidParams {
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("{0}")]
    Handler(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation '{operation}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Circuit breaker '{name}' is open. Retry after {retry_after_secs} seconds")]
    CircuitOpen { name: String, retry_after_secs: u64 },

    #[error("Bulkhead '{name}' rejected request: {reason}")]
    BulkheadRejected { name: String, reason: BulkheadRejection },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadRejection {
    QueueFull,
    QueueTimeout,
    Evicted,
}

impl std::fmt::Display for BulkheadRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkheadRejection::QueueFull => write!(f, "queue is full"),
            BulkheadRejection::QueueTimeout => write!(f, "timed out waiting in queue"),
            BulkheadRejection::Evicted => write!(f, "evicted from queue by a newer call"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Transport does not support {0}")]
    Unsupported(&'static str),

    #[error("Transport closed")]
    Closed,

    #[error("Transport already started")]
    AlreadyStarted,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Entry file for plugin '{name}' not found: {entry}")]
    EntryNotFound { name: String, entry: String },

    #[error("Unsupported integrity algorithm '{algorithm}' for plugin '{name}'")]
    UnsupportedIntegrityAlgorithm { name: String, algorithm: String },

    #[error("Integrity check failed for plugin '{name}': expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Circular dependency detected at plugin '{name}'")]
    CircularDependency { name: String },

    #[error("Invalid plugin module '{name}': {reason}")]
    InvalidPluginModule { name: String, reason: String },

    #[error("Plugin '{name}' is not installed")]
    NotInstalled { name: String },

    #[error("Plugin '{name}' is activated and cannot be reinstalled")]
    AlreadyActivated { name: String },

    #[error("Plugin '{name}' still has active dependents: {}", .dependents.join(", "))]
    ActiveDependents { name: String, dependents: Vec<String> },

    #[error("Plugin '{name}' failed to initialize: {reason}")]
    InitializationFailed { name: String, reason: String },

    #[error("Plugin I/O error: {reason}")]
    Io { reason: String },
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::InvalidManifest { .. } => ErrorKind::InvalidManifest,
            PluginError::EntryNotFound { .. } => ErrorKind::EntryNotFound,
            PluginError::UnsupportedIntegrityAlgorithm { .. } => {
                ErrorKind::UnsupportedIntegrityAlgorithm
            }
            PluginError::IntegrityCheckFailed { .. } => ErrorKind::IntegrityCheckFailed,
            PluginError::CircularDependency { .. } => ErrorKind::CircularDependency,
            PluginError::InvalidPluginModule { .. } => ErrorKind::InvalidPluginModule,
            PluginError::NotInstalled { .. } => ErrorKind::PluginNotFound,
            _ => ErrorKind::InternalError,
        }
    }
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RuntimeError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            RuntimeError::InvalidParams { .. } => ErrorKind::InvalidParams,
            RuntimeError::HandlerNotFound(_) => ErrorKind::HandlerNotFound,
            RuntimeError::Handler(_) => ErrorKind::HandlerFailed,
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            RuntimeError::BulkheadRejected { .. } => ErrorKind::BulkheadRejected,
            RuntimeError::Plugin(e) => e.kind(),
            RuntimeError::Transport(TransportError::Unsupported(_)) => ErrorKind::Unsupported,
            RuntimeError::Config(_)
            | RuntimeError::Transport(_)
            | RuntimeError::Io(_)
            | RuntimeError::Serialization(_)
            | RuntimeError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Application-level failure raised by a tool implementation.
    pub fn handler(message: impl Into<String>) -> Self {
        RuntimeError::Handler(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        RuntimeError::InvalidParams {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Whether this error stems from rejected input rather than a failing
    /// downstream operation.
    pub fn is_validation(&self) -> bool {
        matches!(self, RuntimeError::InvalidParams { .. })
            || self.to_string().to_lowercase().contains("validation")
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RuntimeError::MethodNotFound("x".into()).kind(),
            ErrorKind::MethodNotFound
        );
        assert_eq!(
            RuntimeError::from(PluginError::CircularDependency { name: "a".into() }).kind(),
            ErrorKind::CircularDependency
        );
        assert_eq!(
            RuntimeError::from(TransportError::Unsupported("broadcast")).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            RuntimeError::from(io::Error::new(io::ErrorKind::Other, "disk")).kind(),
            ErrorKind::InternalError
        );
    }

    #[test]
    fn test_standard_codes() {
        assert_eq!(ErrorKind::InvalidRequest.code(), -32600);
        assert_eq!(ErrorKind::MethodNotFound.code(), -32601);
        assert_eq!(ErrorKind::InvalidParams.code(), -32602);
        assert_eq!(ErrorKind::InternalError.code(), -32603);
    }

    #[test]
    fn test_validation_detection() {
        assert!(RuntimeError::invalid_params("bad").is_validation());
        assert!(RuntimeError::handler("Validation failed for field x").is_validation());
        assert!(!RuntimeError::handler("connection reset").is_validation());
    }

    #[test]
    fn test_circuit_open_message_names_cooldown() {
        let err = RuntimeError::CircuitOpen {
            name: "db".into(),
            retry_after_secs: 12,
        };
        assert!(err.to_string().contains("12 seconds"));
    }
}
