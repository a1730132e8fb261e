//! Error types for the worker SDK.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure of the worker loop itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Reading requests or writing responses failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A response could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The response writer task ended early.
    #[error("response writer stopped: {0}")]
    Writer(String),
}

/// Result type for the worker loop.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Error an action or qualifier handler reports back to the runtime.
///
/// `code` is one of the runtime's kebab-case error names
/// (`invalid-arguments`, `permission-denied`, ...). The runtime maps an
/// absent code to `general`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ActionError {
    /// Human-readable message.
    pub message: String,
    /// Error classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Machine-readable context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl ActionError {
    /// Unclassified error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            detail: Value::Null,
        }
    }

    /// Set the error classification.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach machine-readable context.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// The input was rejected.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(message).with_code("invalid-arguments")
    }

    /// No handler is registered under `name`.
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::new(format!("unknown {kind}: {name}")).with_code("action-not-found")
    }

    /// The worker does not support `method`.
    pub fn not_implemented(method: &str) -> Self {
        Self::new(format!("method not supported by this worker: {method}"))
            .with_code("not-implemented")
    }

    /// A handler failed unexpectedly.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message).with_code("internal-error")
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_arguments(e.to_string())
    }
}

/// Result returned by handlers.
pub type ActionResult = Result<Value, ActionError>;
