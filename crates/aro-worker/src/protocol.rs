//! Request and response lines as the worker sees them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActionError, ActionResult};

/// Metadata query.
pub const METHOD_INFO: &str = "info";
/// Action invocation.
pub const METHOD_EXECUTE: &str = "execute";
/// Qualifier application.
pub const METHOD_QUALIFIER: &str = "qualifier";
/// Graceful shutdown.
pub const METHOD_SHUTDOWN: &str = "shutdown";

/// One request line from the runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Correlation id echoed in the response.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// One response line to the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    /// Success value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl Response {
    /// Build the response for `id` from a handler result.
    #[must_use]
    pub fn from_result(id: u64, result: ActionResult) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                id,
                result: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecuteParams {
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) input: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QualifierParams {
    pub(crate) qualifier: String,
    #[serde(default)]
    pub(crate) value: Value,
    #[serde(default, rename = "type")]
    pub(crate) type_name: String,
}
