//! JSON encoding of invocation payloads and decoding of responses.
//!
//! Both transports carry JSON. A response is an error when it is an object
//! with an `error` key, either the legacy `{"error": "message"}` form or a
//! structured `{"error": {"message", "code", "detail"}}`. Anything else is
//! the success value.

use serde_json::Value;

use super::error::{InvocationResult, StructuredError};

/// Largest integer a JSON number is guaranteed to carry exactly across
/// runtimes that decode numbers as doubles.
pub const MAX_SAFE_INTEGER: u64 = 1 << 53;

/// Whether any integer inside `value` exceeds [`MAX_SAFE_INTEGER`] in
/// magnitude.
#[must_use]
pub fn exceeds_safe_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u > MAX_SAFE_INTEGER
            } else if let Some(i) = n.as_i64() {
                i.unsigned_abs() > MAX_SAFE_INTEGER
            } else {
                false
            }
        },
        Value::Array(items) => items.iter().any(exceeds_safe_integer),
        Value::Object(map) => map.values().any(exceeds_safe_integer),
        _ => false,
    }
}

/// Log a warning when `value` holds integers that some plugin runtimes
/// cannot represent exactly. The value is sent unchanged.
pub fn warn_if_imprecise(target: &str, value: &Value) {
    if exceeds_safe_integer(value) {
        tracing::warn!(
            target_name = target,
            "payload contains integers beyond 2^53; precision may be lost in the plugin"
        );
    }
}

/// Serialize an argument payload, warning about imprecise integers.
///
/// # Errors
///
/// Returns an internal error if serialization fails.
pub fn encode_payload(target: &str, value: &Value) -> Result<String, StructuredError> {
    warn_if_imprecise(target, value);
    serde_json::to_string(value)
        .map_err(|e| StructuredError::internal(format!("failed to encode payload: {e}")))
}

/// Decode a raw response string from a compiled library.
///
/// # Errors
///
/// Returns an internal error for text that is not JSON, and the plugin's
/// own error when the response carries one.
pub fn decode_response(raw: &str) -> InvocationResult {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        StructuredError::internal(format!("plugin returned malformed JSON: {e}"))
    })?;
    interpret_response(value)
}

/// Split an already decoded response into success value or error.
///
/// # Errors
///
/// Returns the plugin's error when the response is an error object.
pub fn interpret_response(value: Value) -> InvocationResult {
    match value {
        Value::Object(mut map) if map.contains_key("error") => {
            let error = map.remove("error").unwrap_or(Value::Null);
            Err(decode_error(error))
        },
        other => Ok(other),
    }
}

/// Decode an error payload in either the legacy string form or the
/// structured form.
#[must_use]
pub fn decode_error(error: Value) -> StructuredError {
    match error {
        Value::String(message) => StructuredError::general(message),
        Value::Object(_) => match serde_json::from_value::<StructuredError>(error.clone()) {
            Ok(structured) => structured,
            Err(_) => StructuredError::general(error.to_string()).with_detail(error),
        },
        Value::Null => StructuredError::general("plugin reported an error without a message"),
        other => StructuredError::general(other.to_string()),
    }
}

/// Unwrap a qualifier response, which carries its value under `result`.
/// Responses without that key are passed through unchanged.
///
/// # Errors
///
/// Returns the plugin's error when the response is an error object.
pub fn interpret_qualifier_response(value: Value) -> InvocationResult {
    match interpret_response(value)? {
        Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(Value::Null))
        },
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_success_value_passes_through() {
        let value = decode_response(r#"{"rows": [[1, 2]]}"#).unwrap();
        assert_eq!(value, json!({ "rows": [[1, 2]] }));
    }

    #[test]
    fn test_legacy_error_string() {
        let err = decode_response(r#"{"error": "Unknown action: nope"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::General);
        assert_eq!(err.message, "Unknown action: nope");
    }

    #[test]
    fn test_structured_error() {
        let err = decode_response(
            r#"{"error": {"message": "bad delimiter", "code": 2, "detail": {"field": "delimiter"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(err.detail["field"], "delimiter");
    }

    #[test]
    fn test_unrecognized_error_object_kept_as_detail() {
        let err = interpret_response(json!({ "error": { "reason": "x" } })).unwrap_err();
        assert_eq!(err.code, ErrorCode::General);
        assert_eq!(err.detail["reason"], "x");
    }

    #[test]
    fn test_malformed_json_is_internal() {
        let err = decode_response("not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[test]
    fn test_qualifier_result_unwrapped() {
        assert_eq!(
            interpret_qualifier_response(json!({ "result": [1, 2, 3] })).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(interpret_qualifier_response(json!(7)).unwrap(), json!(7));
        assert!(interpret_qualifier_response(json!({ "error": "sort requires a list" })).is_err());
    }

    #[test]
    fn test_safe_integer_detection() {
        assert!(!exceeds_safe_integer(&json!({ "n": 9_007_199_254_740_992_u64 })));
        assert!(exceeds_safe_integer(&json!({ "n": 9_007_199_254_740_993_u64 })));
        assert!(exceeds_safe_integer(&json!([1, [-9_007_199_254_740_993_i64]])));
        assert!(!exceeds_safe_integer(&json!(1.0e300)));
    }

    #[test]
    fn test_encode_payload() {
        assert_eq!(encode_payload("t", &json!({ "a": 1 })).unwrap(), r#"{"a":1}"#);
    }
}
