//! Fault barrier around native calls.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::bridge::StructuredError;
use crate::plugin::PluginId;

/// Run `f`, turning a panic into an `internal-error` result.
///
/// The closure only borrows the library and owned argument buffers, so
/// observing them after an unwind cannot expose a broken invariant.
pub(super) fn guarded<T>(
    plugin: &PluginId,
    operation: &str,
    f: impl FnOnce() -> Result<T, StructuredError>,
) -> Result<T, StructuredError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(plugin = %plugin, operation, panic = %message, "native call faulted");
        Err(StructuredError::internal(format!(
            "plugin {plugin} faulted during {operation}: {message}"
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ErrorCode;

    #[test]
    fn test_panic_becomes_internal_error() {
        let plugin = PluginId::new("boom").unwrap();
        let result: Result<(), _> = guarded(&plugin, "execute", || panic!("index out of range"));
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(err.message.contains("index out of range"));
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_formatted_panic_message() {
        let plugin = PluginId::new("boom").unwrap();
        let n = 3;
        let result: Result<(), _> = guarded(&plugin, "info", || panic!("bad row {n}"));
        assert!(result.unwrap_err().message.contains("bad row 3"));
    }

    #[test]
    fn test_success_passes_through() {
        let plugin = PluginId::new("ok").unwrap();
        assert_eq!(guarded(&plugin, "execute", || Ok(7)).unwrap(), 7);
    }
}
