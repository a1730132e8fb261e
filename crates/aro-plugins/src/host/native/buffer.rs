//! Ownership of buffers returned across the C ABI.
//!
//! Every string a compiled plugin returns was allocated by the plugin and
//! must go back to the plugin's own free function exactly once. The host
//! wraps each returned pointer in a [`PluginBuffer`] that copies the text
//! out and releases it on drop, and a per-library [`BufferLedger`] tracks
//! which addresses are currently outstanding so a second release of the
//! same address is caught instead of reaching the plugin.

use std::collections::HashSet;
use std::ffi::{CStr, c_char};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::error;

use super::library::NativeLibrary;
use crate::bridge::StructuredError;

/// A breach of the buffer ownership contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// Release of an address that is not outstanding: never handed out, or
    /// already released.
    #[error("double free of plugin buffer at {address:#x}")]
    DoubleFree {
        /// Buffer address.
        address: usize,
    },

    /// The plugin handed out an address that is still outstanding.
    #[error("plugin returned buffer {address:#x} while it was still outstanding")]
    AliasedBuffer {
        /// Buffer address.
        address: usize,
    },
}

/// Outstanding plugin buffers of one library.
#[derive(Debug, Default)]
pub struct BufferLedger {
    outstanding: Mutex<HashSet<usize>>,
}

impl BufferLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a buffer the plugin just returned.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::AliasedBuffer`] if the address is already
    /// outstanding.
    pub fn record(&self, address: usize) -> Result<(), ContractViolation> {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if outstanding.insert(address) {
            Ok(())
        } else {
            Err(ContractViolation::AliasedBuffer { address })
        }
    }

    /// Mark a buffer released. Only after this succeeds may the plugin's
    /// free function be called.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::DoubleFree`] if the address is not
    /// outstanding.
    pub fn release(&self, address: usize) -> Result<(), ContractViolation> {
        let removed = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
        if removed {
            Ok(())
        } else {
            Err(ContractViolation::DoubleFree { address })
        }
    }

    /// Number of buffers handed out and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A string buffer owned by the plugin, released exactly once on drop.
pub struct PluginBuffer<'lib> {
    ptr: *mut c_char,
    library: &'lib NativeLibrary,
}

impl<'lib> PluginBuffer<'lib> {
    /// Take ownership of `ptr`, recording it in the library's ledger.
    ///
    /// # Errors
    ///
    /// Returns an internal error for a null pointer or an address that is
    /// already outstanding. Neither is released.
    pub(crate) fn adopt(
        library: &'lib NativeLibrary,
        ptr: *mut c_char,
        operation: &str,
    ) -> Result<Self, StructuredError> {
        if ptr.is_null() {
            return Err(StructuredError::internal(format!(
                "{operation} returned a null pointer"
            )));
        }
        library.ledger().record(ptr as usize).map_err(|violation| {
            error!(%violation, operation, "plugin buffer contract violated");
            StructuredError::internal(violation.to_string())
        })?;
        Ok(Self { ptr, library })
    }

    /// Copy the buffer's text.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the text is not UTF-8.
    #[allow(unsafe_code)]
    pub fn read(&self) -> Result<String, StructuredError> {
        // SAFETY: `adopt` rejected null, and the plugin contract requires a
        // NUL-terminated string that stays valid until it is freed, which
        // cannot happen before `self` is dropped.
        let text = unsafe { CStr::from_ptr(self.ptr) };
        text.to_str().map(str::to_owned).map_err(|e| {
            StructuredError::internal(format!("plugin returned invalid UTF-8: {e}"))
        })
    }
}

impl Drop for PluginBuffer<'_> {
    fn drop(&mut self) {
        if let Err(violation) = self.library.release(self.ptr) {
            error!(%violation, "plugin buffer contract violated on release");
        }
    }
}
