//! JSON-lines wire protocol between the runtime and worker processes.
//!
//! ```text
//! → {"id": 7, "method": "execute", "params": {"action": "to-html", "input": {...}}}
//! ← {"id": 7, "result": {...}}
//! ← {"id": 7, "error": {"message": "...", "code": 2}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::{InvocationResult, decode_error, interpret_response};

/// Metadata query, sent once as the handshake.
pub const METHOD_INFO: &str = "info";
/// Action or service-method invocation.
pub const METHOD_EXECUTE: &str = "execute";
/// Qualifier application.
pub const METHOD_QUALIFIER: &str = "qualifier";
/// System object read.
pub const METHOD_OBJECT_READ: &str = "object.read";
/// System object write.
pub const METHOD_OBJECT_WRITE: &str = "object.write";
/// System object listing.
pub const METHOD_OBJECT_LIST: &str = "object.list";
/// Graceful shutdown request. The worker answers and exits.
pub const METHOD_SHUTDOWN: &str = "shutdown";

/// A request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per worker.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// A response line. Exactly one of `result` and `error` is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered. Lines without one are ignored.
    #[serde(default)]
    pub id: Option<u64>,
    /// Success value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload, string or structured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    /// Success response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    #[must_use]
    pub fn failure(id: u64, error: Value) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Convert into an invocation result. A `result` that itself carries an
    /// `error` key is treated as an error, matching the library transport.
    ///
    /// # Errors
    ///
    /// Returns the decoded error payload.
    pub fn into_result(self) -> InvocationResult {
        match (self.error, self.result) {
            (Some(error), _) if !error.is_null() => Err(decode_error(error)),
            (_, result) => interpret_response(result.unwrap_or(Value::Null)),
        }
    }
}
