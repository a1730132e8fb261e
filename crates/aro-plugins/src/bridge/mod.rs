//! The invocation bridge: one calling convention for every host.
//!
//! `execute(action, args) -> Result<Value, StructuredError>` is the whole
//! contract. Hosts translate it to their transport (C ABI buffers or JSON
//! lines) using the codec here, so error decoding and precision warnings
//! behave the same everywhere.

mod codec;
mod error;

pub use codec::{
    MAX_SAFE_INTEGER, decode_error, decode_response, encode_payload, exceeds_safe_integer,
    interpret_qualifier_response, interpret_response, warn_if_imprecise,
};
pub use error::{ErrorCode, InvocationResult, StructuredError};
