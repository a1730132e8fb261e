//! Compiled-library host.
//!
//! Native calls are blocking and may misbehave, so each one runs on the
//! blocking thread pool behind a fault barrier. The caller waits at most
//! the configured call timeout; a call that overruns keeps its thread until
//! the plugin returns, and its buffer is still released through the ledger.

mod barrier;
mod buffer;
mod library;

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::PluginHost;
use crate::bridge::{
    InvocationResult, StructuredError, decode_response, encode_payload,
    interpret_qualifier_response,
};
use crate::error::{PluginError, PluginResult};
use crate::manifest::{HostKind, PluginMetadata, ProviderSpec};
use crate::plugin::{PluginId, PluginState, StateCell};

pub use buffer::{BufferLedger, ContractViolation, PluginBuffer};
pub use library::{
    CallFn, EXECUTE_SYMBOL, EntryPoints, FREE_SYMBOL, FreeFn, HookFn, INFO_SYMBOL, INIT_SYMBOL,
    InfoFn, NativeLibrary, QUALIFIER_SYMBOL, SHUTDOWN_SYMBOL, with_platform_extension,
};

enum LibrarySource {
    Path(PathBuf),
    Linked(Option<NativeLibrary>),
}

/// Host for a natively compiled dynamic library.
pub struct CompiledLibraryHost {
    plugin: PluginId,
    provider: ProviderSpec,
    call_timeout: Duration,
    source: LibrarySource,
    state: StateCell,
    library: Mutex<Option<Arc<NativeLibrary>>>,
    metadata: Option<PluginMetadata>,
}

impl CompiledLibraryHost {
    /// Host for the library at `path`.
    #[must_use]
    pub fn new(
        plugin: PluginId,
        path: PathBuf,
        provider: ProviderSpec,
        call_timeout: Duration,
    ) -> Self {
        Self::with_source(plugin, LibrarySource::Path(path), provider, call_timeout)
    }

    /// Host for entry points already linked into the process.
    #[must_use]
    pub fn linked(
        plugin: PluginId,
        library: NativeLibrary,
        provider: ProviderSpec,
        call_timeout: Duration,
    ) -> Self {
        Self::with_source(
            plugin,
            LibrarySource::Linked(Some(library)),
            provider,
            call_timeout,
        )
    }

    fn with_source(
        plugin: PluginId,
        source: LibrarySource,
        provider: ProviderSpec,
        call_timeout: Duration,
    ) -> Self {
        Self {
            plugin,
            provider,
            call_timeout,
            source,
            state: StateCell::new(),
            library: Mutex::new(None),
            metadata: None,
        }
    }

    /// Buffers handed out by the library and not yet released. Zero when
    /// nothing is loaded.
    #[must_use]
    pub fn outstanding_buffers(&self) -> usize {
        self.current_library()
            .map_or(0, |lib| lib.outstanding_buffers())
    }

    fn current_library(&self) -> Option<Arc<NativeLibrary>> {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn loaded_library(&self) -> Result<Arc<NativeLibrary>, StructuredError> {
        self.current_library().ok_or_else(|| {
            StructuredError::invalid_state(format!(
                "plugin {} is {}",
                self.plugin,
                self.state.get()
            ))
        })
    }

    async fn open(&mut self) -> PluginResult<PluginMetadata> {
        let library = match &mut self.source {
            LibrarySource::Path(path) => NativeLibrary::open(path, &self.plugin)?,
            LibrarySource::Linked(library) => {
                library.take().ok_or_else(|| PluginError::InvalidState {
                    plugin: self.plugin.clone(),
                    state: "consumed".into(),
                    expected: "unloaded",
                })?
            },
        };
        let library = Arc::new(library);

        let raw = self
            .call(Arc::clone(&library), INIT_SYMBOL, |lib| {
                lib.init();
                lib.info()
            })
            .await
            .map_err(|e| PluginError::MalformedMetadata {
                plugin: self.plugin.clone(),
                message: e.message,
            })?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| PluginError::MalformedMetadata {
                plugin: self.plugin.clone(),
                message: format!("{INFO_SYMBOL} returned malformed JSON: {e}"),
            })?;
        let metadata =
            PluginMetadata::from_value(&self.plugin, value)?.reconcile(&self.plugin, &self.provider)?;
        if let Some(object) = metadata.system_objects.first() {
            return Err(PluginError::MalformedMetadata {
                plugin: self.plugin.clone(),
                message: format!(
                    "compiled libraries cannot serve system objects (reported '{}')",
                    object.name
                ),
            });
        }

        *self.library.lock().unwrap_or_else(PoisonError::into_inner) = Some(library);
        Ok(metadata)
    }

    /// Run `f` against the library on the blocking pool, behind the fault
    /// barrier, waiting at most the call timeout.
    async fn call<T, F>(
        &self,
        library: Arc<NativeLibrary>,
        operation: &'static str,
        f: F,
    ) -> Result<T, StructuredError>
    where
        T: Send + 'static,
        F: FnOnce(&NativeLibrary) -> Result<T, StructuredError> + Send + 'static,
    {
        let plugin = self.plugin.clone();
        let task = tokio::task::spawn_blocking(move || {
            barrier::guarded(&plugin, operation, || f(&library))
        });
        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StructuredError::internal(format!(
                "native call task failed: {join_error}"
            ))),
            Err(_) => {
                warn!(
                    plugin = %self.plugin,
                    operation,
                    timeout_ms = u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                    "native call timed out, abandoning wait"
                );
                Err(StructuredError::timeout(self.call_timeout))
            },
        }
    }
}

fn c_string(what: &str, text: &str) -> Result<CString, StructuredError> {
    CString::new(text)
        .map_err(|_| StructuredError::invalid_arguments(format!("{what} contains a NUL byte")))
}

#[async_trait]
impl PluginHost for CompiledLibraryHost {
    fn kind(&self) -> HostKind {
        HostKind::CompiledLibrary
    }

    fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    fn state(&self) -> PluginState {
        self.state.get()
    }

    fn metadata(&self) -> Option<&PluginMetadata> {
        self.metadata.as_ref()
    }

    async fn load(&mut self) -> PluginResult<PluginMetadata> {
        self.state.begin_load(&self.plugin)?;
        let result = self.open().await;
        let metadata = self.state.finish_load(result)?;
        info!(
            plugin = %self.plugin,
            actions = metadata.actions.len(),
            qualifiers = metadata.qualifiers.len(),
            "compiled library loaded"
        );
        self.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    async fn execute(&self, action: &str, input: Value) -> InvocationResult {
        let library = self.loaded_library()?;
        let action_c = c_string("action name", action)?;
        let input_c = c_string("input", &encode_payload(action, &input)?)?;
        debug!(plugin = %self.plugin, action, "native execute");
        let raw = self
            .call(library, EXECUTE_SYMBOL, move |lib| {
                lib.execute(&action_c, &input_c)
            })
            .await?;
        decode_response(&raw)
    }

    async fn apply_qualifier(
        &self,
        qualifier: &str,
        value: Value,
        type_name: &str,
    ) -> InvocationResult {
        let library = self.loaded_library()?;
        if !library.has_qualifiers() {
            return Err(StructuredError::not_implemented(format!(
                "plugin {} exports no qualifiers",
                self.plugin
            )));
        }
        let payload = serde_json::json!({ "value": value, "type": type_name });
        let name_c = c_string("qualifier name", qualifier)?;
        let input_c = c_string("input", &encode_payload(qualifier, &payload)?)?;
        let raw = self
            .call(library, QUALIFIER_SYMBOL, move |lib| {
                lib.qualifier(&name_c, &input_c).unwrap_or_else(|| {
                    Err(StructuredError::not_implemented("qualifier entry point vanished"))
                })
            })
            .await?;
        interpret_qualifier_response(decode_response(&raw)?)
    }

    async fn shutdown(&self) {
        let library = self
            .library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(library) = library {
            if let Err(e) = self
                .call(library, SHUTDOWN_SYMBOL, |lib| {
                    lib.shutdown();
                    Ok(())
                })
                .await
            {
                warn!(plugin = %self.plugin, error = %e, "plugin shutdown hook failed");
            }
            info!(plugin = %self.plugin, "compiled library unloaded");
        }
        self.state.shut_down();
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use std::ffi::{CStr, c_char};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::bridge::ErrorCode;

    // Each test owns a distinct set of counters; entry points are plain
    // `extern "C-unwind"` fns so they cannot capture state.
    macro_rules! counting_plugin {
        ($mod_name:ident) => {
            #[allow(dead_code)]
            mod $mod_name {
                use super::*;

                pub static ALLOCS: AtomicUsize = AtomicUsize::new(0);
                pub static FREES: AtomicUsize = AtomicUsize::new(0);

                fn hand_out(text: String) -> *mut c_char {
                    ALLOCS.fetch_add(1, Ordering::SeqCst);
                    CString::new(text).unwrap().into_raw()
                }

                pub extern "C-unwind" fn info() -> *mut c_char {
                    hand_out(
                        json!({
                            "name": "plugin-rust-csv",
                            "version": "1.0.0",
                            "actions": ["parse-csv", { "name": "fail", "verbs": ["fail"] }],
                            "qualifiers": [{ "name": "reverse", "inputTypes": ["List"] }]
                        })
                        .to_string(),
                    )
                }

                pub extern "C-unwind" fn execute(action: *const c_char, input: *const c_char) -> *mut c_char {
                    let action = unsafe { CStr::from_ptr(action) }.to_str().unwrap();
                    let input: Value =
                        serde_json::from_str(unsafe { CStr::from_ptr(input) }.to_str().unwrap())
                            .unwrap();
                    let out = match action {
                        "parse-csv" => {
                            let rows: Vec<Vec<&str>> = input["data"]
                                .as_str()
                                .unwrap_or_default()
                                .lines()
                                .map(|l| l.split(',').collect())
                                .collect();
                            json!({ "rows": rows })
                        },
                        "fail" => json!({ "error": { "message": "bad delimiter", "code": 2 } }),
                        other => json!({ "error": format!("Unknown action: {other}") }),
                    };
                    hand_out(out.to_string())
                }

                pub extern "C-unwind" fn qualifier(name: *const c_char, input: *const c_char) -> *mut c_char {
                    let name = unsafe { CStr::from_ptr(name) }.to_str().unwrap();
                    let input: Value =
                        serde_json::from_str(unsafe { CStr::from_ptr(input) }.to_str().unwrap())
                            .unwrap();
                    let out = match (name, input["value"].as_array()) {
                        ("reverse", Some(items)) => {
                            json!({ "result": items.iter().rev().collect::<Vec<_>>() })
                        },
                        _ => json!({ "error": "reverse requires a list" }),
                    };
                    hand_out(out.to_string())
                }

                pub extern "C-unwind" fn null_execute(_: *const c_char, _: *const c_char) -> *mut c_char {
                    std::ptr::null_mut()
                }

                pub extern "C-unwind" fn free(ptr: *mut c_char) {
                    FREES.fetch_add(1, Ordering::SeqCst);
                    drop(unsafe { CString::from_raw(ptr) });
                }

                pub fn entry_points() -> EntryPoints {
                    EntryPoints {
                        info,
                        execute,
                        free,
                        qualifier: Some(qualifier),
                        init: None,
                        shutdown: None,
                    }
                }
            }
        };
    }

    counting_plugin!(leak_check);
    counting_plugin!(behaviour);
    counting_plugin!(nulls);
    counting_plugin!(double_free);
    counting_plugin!(panics);
    counting_plugin!(objects);
    counting_plugin!(parallel);

    extern "C-unwind" fn panicking_execute(_: *const c_char, _: *const c_char) -> *mut c_char {
        panic!("plugin bug");
    }

    extern "C-unwind" fn info_with_objects() -> *mut c_char {
        CString::new(
            json!({
                "name": "boom",
                "actions": ["parse-csv"],
                "systemObjects": [{ "name": "cache", "capabilities": ["readable"] }]
            })
            .to_string(),
        )
        .unwrap()
        .into_raw()
    }

    fn provider() -> ProviderSpec {
        serde_json::from_value(json!({ "type": "compiled-library", "path": "lib/csv" })).unwrap()
    }

    async fn loaded(entry: EntryPoints) -> CompiledLibraryHost {
        let mut host = CompiledLibraryHost::linked(
            PluginId::new("plugin-rust-csv").unwrap(),
            NativeLibrary::from_entry_points(entry),
            provider(),
            Duration::from_secs(5),
        );
        host.load().await.unwrap();
        host
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ten_thousand_calls_leave_nothing_outstanding() {
        let host = loaded(leak_check::entry_points()).await;
        for i in 0..10_000 {
            let out = host
                .execute("parse-csv", json!({ "data": format!("{i},x") }))
                .await
                .unwrap();
            assert_eq!(out["rows"][0][1], "x");
        }
        assert_eq!(host.outstanding_buffers(), 0);
        assert_eq!(
            leak_check::ALLOCS.load(Ordering::SeqCst),
            leak_check::FREES.load(Ordering::SeqCst)
        );
        // info + 10,000 executes
        assert_eq!(leak_check::FREES.load(Ordering::SeqCst), 10_001);
    }

    #[tokio::test]
    async fn test_metadata_and_errors() {
        let host = loaded(behaviour::entry_points()).await;
        assert_eq!(host.state(), PluginState::Loaded);
        let metadata = host.metadata().unwrap();
        assert_eq!(metadata.actions[0].verbs, vec!["parsecsv"]);

        let err = host.execute("fail", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(err.message, "bad delimiter");

        let err = host.execute("nope", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::General);
        assert!(err.message.contains("Unknown action"));

        let err = host.execute("bad\0name", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);

        assert_eq!(
            host.apply_qualifier("reverse", json!([1, 2, 3]), "List")
                .await
                .unwrap(),
            json!([3, 2, 1])
        );
        assert!(host.apply_qualifier("reverse", json!("x"), "String").await.is_err());

        assert_eq!(host.outstanding_buffers(), 0);
        host.shutdown().await;
        assert_eq!(host.state(), PluginState::Unloaded);
        assert_eq!(
            host.execute("parse-csv", json!({})).await.unwrap_err().code,
            ErrorCode::InvalidState
        );
    }

    #[tokio::test]
    async fn test_null_return_is_internal_error() {
        let mut entry = nulls::entry_points();
        entry.execute = nulls::null_execute;
        let host = loaded(entry).await;
        let err = host.execute("parse-csv", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(err.message.contains("null"));
        assert_eq!(host.outstanding_buffers(), 0);
    }

    #[tokio::test]
    async fn test_panicking_entry_point_becomes_internal_error() {
        let mut entry = panics::entry_points();
        entry.execute = panicking_execute;
        let host = loaded(entry).await;

        let err = host.execute("parse-csv", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(err.message.contains("plugin bug"));
        assert_eq!(host.outstanding_buffers(), 0);

        // The library stays usable after the unwind.
        assert_eq!(
            host.apply_qualifier("reverse", json!([1, 2]), "List")
                .await
                .unwrap(),
            json!([2, 1])
        );
        assert_eq!(host.state(), PluginState::Loaded);
    }

    #[tokio::test]
    async fn test_library_reporting_objects_fails_to_load() {
        let mut entry = objects::entry_points();
        entry.info = info_with_objects;
        let mut host = CompiledLibraryHost::linked(
            PluginId::new("boom").unwrap(),
            NativeLibrary::from_entry_points(entry),
            provider(),
            Duration::from_secs(5),
        );
        let err = host.load().await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::MalformedMetadata { ref message, .. } if message.contains("cache")
        ));
        assert!(matches!(host.state(), PluginState::LoadFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_share_one_ledger() {
        let host = Arc::new(loaded(parallel::entry_points()).await);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let host = Arc::clone(&host);
            tasks.spawn(async move {
                for j in 0..50 {
                    let out = host
                        .execute("parse-csv", json!({ "data": format!("{i},{j}") }))
                        .await
                        .unwrap();
                    assert_eq!(out["rows"][0], json!([i.to_string(), j.to_string()]));
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert_eq!(host.outstanding_buffers(), 0);
        // info + 64 * 50 executes
        assert_eq!(parallel::FREES.load(Ordering::SeqCst), 3_201);
        assert_eq!(
            parallel::ALLOCS.load(Ordering::SeqCst),
            parallel::FREES.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_double_free_never_reaches_plugin() {
        let library = NativeLibrary::from_entry_points(double_free::entry_points());
        let raw = CString::new("{}").unwrap().into_raw();

        // Never handed out through the ledger: treated as already released.
        assert_eq!(
            library.release(raw),
            Err(ContractViolation::DoubleFree {
                address: raw as usize
            })
        );
        assert_eq!(double_free::FREES.load(Ordering::SeqCst), 0);

        // A buffer adopted and forgotten shows up as outstanding.
        let buffer = PluginBuffer::adopt(&library, raw, "test").unwrap();
        std::mem::forget(buffer);
        assert_eq!(library.outstanding_buffers(), 1);

        library.release(raw).unwrap();
        assert_eq!(library.outstanding_buffers(), 0);
        assert_eq!(double_free::FREES.load(Ordering::SeqCst), 1);
        assert!(library.release(raw).is_err());
        assert_eq!(double_free::FREES.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_rejects_undeclared_action() {
        let provider: ProviderSpec = serde_json::from_value(json!({
            "type": "compiled-library",
            "path": "lib/csv",
            "actions": [{ "name": "format-csv" }]
        }))
        .unwrap();
        let mut host = CompiledLibraryHost::linked(
            PluginId::new("plugin-rust-csv").unwrap(),
            NativeLibrary::from_entry_points(behaviour::entry_points()),
            provider,
            Duration::from_secs(5),
        );
        let err = host.load().await.unwrap_err();
        assert!(matches!(err, PluginError::MalformedMetadata { .. }));
        assert!(matches!(host.state(), PluginState::LoadFailed(_)));
        assert!(host.load().await.is_err());
    }
}
