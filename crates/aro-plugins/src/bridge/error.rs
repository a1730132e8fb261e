//! Invocation error taxonomy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Numeric error codes shared by every transport.
///
/// Codes `0..=10` are the stable plugin ABI. `HostTerminated` (11) is an
/// extension used only by the runtime when a subprocess worker dies with
/// calls in flight; plugins never return it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Not an error. Present for ABI completeness.
    Success = 0,
    /// Unclassified failure.
    General = 1,
    /// Arguments missing, mistyped, or not allowed.
    InvalidArguments = 2,
    /// No action, method, qualifier or object with that name.
    ActionNotFound = 3,
    /// A resource the call needs is unavailable.
    ResourceUnavailable = 4,
    /// The target does not permit the operation.
    PermissionDenied = 5,
    /// The call did not finish in time.
    Timeout = 6,
    /// A fault inside the plugin or the bridge.
    InternalError = 7,
    /// The target does not implement the operation.
    NotImplemented = 8,
    /// The target is not in a state that accepts calls.
    InvalidState = 9,
    /// The plugin is rate limiting.
    RateLimited = 10,
    /// The subprocess worker exited while the call was in flight.
    HostTerminated = 11,
}

const ALL_CODES: [ErrorCode; 12] = [
    ErrorCode::Success,
    ErrorCode::General,
    ErrorCode::InvalidArguments,
    ErrorCode::ActionNotFound,
    ErrorCode::ResourceUnavailable,
    ErrorCode::PermissionDenied,
    ErrorCode::Timeout,
    ErrorCode::InternalError,
    ErrorCode::NotImplemented,
    ErrorCode::InvalidState,
    ErrorCode::RateLimited,
    ErrorCode::HostTerminated,
];

impl ErrorCode {
    /// Numeric wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Look up a code by its numeric value.
    #[must_use]
    pub fn from_u8(code: u8) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_u8() == code)
    }

    /// Kebab-case name (`invalid-arguments`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::General => "general",
            Self::InvalidArguments => "invalid-arguments",
            Self::ActionNotFound => "action-not-found",
            Self::ResourceUnavailable => "resource-unavailable",
            Self::PermissionDenied => "permission-denied",
            Self::Timeout => "timeout",
            Self::InternalError => "internal-error",
            Self::NotImplemented => "not-implemented",
            Self::InvalidState => "invalid-state",
            Self::RateLimited => "rate-limited",
            Self::HostTerminated => "host-terminated",
        }
    }

    /// Look up a code by its kebab-case name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Accepts the numeric code or its kebab-case name. Unknown values map to
/// [`ErrorCode::General`] so a plugin on a newer ABI still produces a
/// usable error.
impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Name(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(n) => u8::try_from(n)
                .ok()
                .and_then(Self::from_u8)
                .unwrap_or(Self::General),
            Raw::Name(s) => Self::from_name(&s).unwrap_or(Self::General),
        })
    }
}

/// The error half of an invocation result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StructuredError {
    /// Human-readable message.
    pub message: String,
    /// Classification.
    #[serde(default = "general")]
    pub code: ErrorCode,
    /// Machine-readable context (`{"capability": "readable"}`, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

fn general() -> ErrorCode {
    ErrorCode::General
}

impl StructuredError {
    /// Create an error with no detail.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            detail: Value::Null,
        }
    }

    /// Attach detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Unclassified plugin-side failure.
    #[must_use]
    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::General, message)
    }

    /// Bad arguments.
    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArguments, message)
    }

    /// Unknown action, method, qualifier or object.
    #[must_use]
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::new(ErrorCode::ActionNotFound, format!("{kind} not found: {name}"))
            .with_detail(serde_json::json!({ "kind": kind, "name": name }))
    }

    /// The caller gave up waiting.
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        let ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        Self::new(ErrorCode::Timeout, format!("call timed out after {ms}ms"))
            .with_detail(serde_json::json!({ "timeout_ms": ms }))
    }

    /// Fault inside the plugin or the bridge.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Operation not provided by the target.
    #[must_use]
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    /// Target is not accepting calls.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    /// Worker process died with the call in flight.
    #[must_use]
    pub fn host_terminated(plugin: &str) -> Self {
        Self::new(
            ErrorCode::HostTerminated,
            format!("host terminated: plugin {plugin} exited"),
        )
        .with_detail(serde_json::json!({ "plugin": plugin }))
    }

    /// A system object lacks the capability the operation needs.
    /// `adjective` is `readable`, `writable`, `enumerable` or `watchable`.
    #[must_use]
    pub fn missing_capability(object: &str, adjective: &str) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            format!("{object} is not {adjective}"),
        )
        .with_detail(serde_json::json!({ "object": object, "capability": adjective }))
    }
}

/// Result of every call crossing the invocation bridge.
pub type InvocationResult = Result<Value, StructuredError>;
