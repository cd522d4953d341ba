//! Tool input validation

use crate::error::{FieldError, Result, RuntimeError};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

pub trait InputValidator: Send + Sync + 'static {
    /// JSON Schema advertised to clients.
    fn schema(&self) -> Value;

    /// Returns every violation found in `input`; empty means valid.
    fn validate(&self, input: &Value) -> Vec<FieldError>;
}

/// Validator for tools that take arbitrary input.
pub struct AcceptAny;

impl InputValidator for AcceptAny {
    fn schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    fn validate(&self, _input: &Value) -> Vec<FieldError> {
        Vec::new()
    }
}

/// Compiled JSON Schema (draft 2020-12) validator.
pub struct JsonSchemaValidator {
    raw: Value,
    compiled: JSONSchema,
}

impl JsonSchemaValidator {
    pub fn new(schema: Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema)
            .map_err(|e| RuntimeError::invalid_params(format!("invalid input schema: {e}")))?;
        Ok(Self {
            raw: schema,
            compiled,
        })
    }
}

impl InputValidator for JsonSchemaValidator {
    fn schema(&self) -> Value {
        self.raw.clone()
    }

    fn validate(&self, input: &Value) -> Vec<FieldError> {
        match self.compiled.validate(input) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    FieldError {
                        path: if path.is_empty() { "/".to_string() } else { path },
                        message: e.to_string(),
                    }
                })
                .collect(),
        }
    }
}
