//! Dynamic library loading and the C entry points.
//!
//! ```c
//! char *aro_plugin_info(void);
//! char *aro_plugin_execute(const char *action, const char *input_json);
//! void  aro_plugin_free(char *ptr);
//!
//! /* optional */
//! char *aro_plugin_qualifier(const char *qualifier, const char *input_json);
//! void  aro_plugin_init(void);
//! void  aro_plugin_shutdown(void);
//! ```
//!
//! Entry points use the `C-unwind` ABI, so a Rust plugin that panics
//! unwinds back into the host's fault barrier instead of aborting the
//! process. Hardware faults (`SIGSEGV`, `SIGBUS`) and foreign exceptions
//! that do not unwind cannot be caught in process; plugins that may crash
//! that way belong in a subprocess provider.

use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::buffer::{BufferLedger, ContractViolation, PluginBuffer};
use crate::bridge::StructuredError;
use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// Metadata query entry point.
pub const INFO_SYMBOL: &str = "aro_plugin_info";
/// Action entry point.
pub const EXECUTE_SYMBOL: &str = "aro_plugin_execute";
/// Buffer release entry point.
pub const FREE_SYMBOL: &str = "aro_plugin_free";
/// Optional qualifier entry point.
pub const QUALIFIER_SYMBOL: &str = "aro_plugin_qualifier";
/// Optional initialization hook.
pub const INIT_SYMBOL: &str = "aro_plugin_init";
/// Optional teardown hook.
pub const SHUTDOWN_SYMBOL: &str = "aro_plugin_shutdown";

/// `aro_plugin_info`.
pub type InfoFn = unsafe extern "C-unwind" fn() -> *mut c_char;
/// `aro_plugin_execute` and `aro_plugin_qualifier`.
pub type CallFn = unsafe extern "C-unwind" fn(*const c_char, *const c_char) -> *mut c_char;
/// `aro_plugin_free`.
pub type FreeFn = unsafe extern "C-unwind" fn(*mut c_char);
/// `aro_plugin_init` and `aro_plugin_shutdown`.
pub type HookFn = unsafe extern "C-unwind" fn();

/// Resolved entry points of one library.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    /// Metadata query.
    pub info: InfoFn,
    /// Action dispatch.
    pub execute: CallFn,
    /// Buffer release.
    pub free: FreeFn,
    /// Qualifier dispatch.
    pub qualifier: Option<CallFn>,
    /// Called once after loading.
    pub init: Option<HookFn>,
    /// Called once before unloading.
    pub shutdown: Option<HookFn>,
}

/// An opened library and the ledger of buffers it has handed out.
///
/// The entry points are only valid while the library stays mapped, so
/// they never leave this struct.
#[derive(Debug)]
pub struct NativeLibrary {
    entry: EntryPoints,
    ledger: BufferLedger,
    // Dropped last: unmaps the code `entry` points into.
    _library: Option<libloading::Library>,
}

impl NativeLibrary {
    /// Open the library at `path`, appending the platform extension when the
    /// path has none, and resolve its entry points.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ArtifactNotFound`] if the file does not exist,
    /// [`PluginError::LibraryLoad`] if it cannot be opened, and
    /// [`PluginError::MissingEntryPoint`] if a mandatory symbol is absent.
    #[allow(unsafe_code)]
    pub fn open(path: &Path, plugin: &PluginId) -> PluginResult<Self> {
        let path = with_platform_extension(path);
        if !path.is_file() {
            return Err(PluginError::ArtifactNotFound {
                plugin: plugin.clone(),
                path,
            });
        }

        debug!(plugin = %plugin, path = %path.display(), "opening plugin library");
        // SAFETY: opening a library runs its initializers. Libraries are
        // only opened from plugin directories the runtime was configured to
        // trust.
        let library =
            unsafe { libloading::Library::new(&path) }.map_err(|e| PluginError::LibraryLoad {
                plugin: plugin.clone(),
                message: e.to_string(),
            })?;

        // SAFETY: the declared types match the documented C signatures.
        let entry = unsafe {
            EntryPoints {
                info: required(&library, plugin, INFO_SYMBOL)?,
                execute: required(&library, plugin, EXECUTE_SYMBOL)?,
                free: required(&library, plugin, FREE_SYMBOL)?,
                qualifier: optional(&library, QUALIFIER_SYMBOL),
                init: optional(&library, INIT_SYMBOL),
                shutdown: optional(&library, SHUTDOWN_SYMBOL),
            }
        };

        Ok(Self {
            entry,
            ledger: BufferLedger::new(),
            _library: Some(library),
        })
    }

    /// Wrap entry points that are already linked into the process.
    #[must_use]
    pub fn from_entry_points(entry: EntryPoints) -> Self {
        Self {
            entry,
            ledger: BufferLedger::new(),
            _library: None,
        }
    }

    /// Buffers handed out and not yet released.
    #[must_use]
    pub fn outstanding_buffers(&self) -> usize {
        self.ledger.outstanding()
    }

    /// Whether the library exports a qualifier entry point.
    #[must_use]
    pub fn has_qualifiers(&self) -> bool {
        self.entry.qualifier.is_some()
    }

    pub(super) fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    /// Query metadata.
    #[allow(unsafe_code)]
    pub(crate) fn info(&self) -> Result<String, StructuredError> {
        // SAFETY: `info` takes no arguments and returns a plugin-owned
        // buffer, adopted immediately.
        let ptr = unsafe { (self.entry.info)() };
        PluginBuffer::adopt(self, ptr, INFO_SYMBOL)?.read()
    }

    /// Run an action.
    #[allow(unsafe_code)]
    pub(crate) fn execute(&self, action: &CStr, input: &CStr) -> Result<String, StructuredError> {
        // SAFETY: both arguments are NUL-terminated and outlive the call.
        let ptr = unsafe { (self.entry.execute)(action.as_ptr(), input.as_ptr()) };
        PluginBuffer::adopt(self, ptr, EXECUTE_SYMBOL)?.read()
    }

    /// Apply a qualifier. `None` when the library exports no qualifiers.
    #[allow(unsafe_code)]
    pub(crate) fn qualifier(
        &self,
        name: &CStr,
        input: &CStr,
    ) -> Option<Result<String, StructuredError>> {
        let qualifier = self.entry.qualifier?;
        // SAFETY: as for `execute`.
        let ptr = unsafe { qualifier(name.as_ptr(), input.as_ptr()) };
        Some(PluginBuffer::adopt(self, ptr, QUALIFIER_SYMBOL).and_then(|b| b.read()))
    }

    /// Run the optional init hook.
    #[allow(unsafe_code)]
    pub(crate) fn init(&self) {
        if let Some(init) = self.entry.init {
            // SAFETY: no arguments, no return value.
            unsafe { init() };
        }
    }

    /// Run the optional shutdown hook.
    #[allow(unsafe_code)]
    pub(crate) fn shutdown(&self) {
        if let Some(shutdown) = self.entry.shutdown {
            // SAFETY: no arguments, no return value.
            unsafe { shutdown() };
        }
    }

    /// Return a buffer to the plugin. The ledger is checked first, so an
    /// address that is not outstanding never reaches the plugin's free.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::DoubleFree`] for an address that is not
    /// outstanding.
    #[allow(unsafe_code)]
    pub(crate) fn release(&self, ptr: *mut c_char) -> Result<(), ContractViolation> {
        self.ledger.release(ptr as usize)?;
        // SAFETY: the ledger confirmed the plugin handed out `ptr` and it
        // has not been released since.
        unsafe { (self.entry.free)(ptr) };
        Ok(())
    }
}

/// Append the platform's dynamic library extension when `path` has none.
#[must_use]
pub fn with_platform_extension(path: &Path) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(std::env::consts::DLL_EXTENSION)
    }
}

#[allow(unsafe_code)]
unsafe fn required<T: Copy>(
    library: &libloading::Library,
    plugin: &PluginId,
    symbol: &'static str,
) -> PluginResult<T> {
    // SAFETY: upheld by the caller.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .map_err(|_| PluginError::MissingEntryPoint {
            plugin: plugin.clone(),
            symbol,
        })
}

#[allow(unsafe_code)]
unsafe fn optional<T: Copy>(library: &libloading::Library, symbol: &str) -> Option<T> {
    // SAFETY: upheld by the caller.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .ok()
        .map(|s| *s)
}
