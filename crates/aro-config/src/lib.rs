#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Layered configuration for the ARO plugin runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use aro_config::Config;
//!
//! let loaded = Config::load(Some(std::path::Path::new("."))).unwrap();
//! println!("plugin dirs: {:?}", loaded.config.plugins.directories);
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. `ARO_*` environment variables
//! 2. Workspace (`{workspace}/.aro/config.toml`)
//! 3. User (`~/.aro/config.toml`)
//! 4. Embedded defaults (`defaults.toml`)
//!
//! This crate depends on no other `aro-*` crate. Conversion into runtime
//! types happens where the runtime is constructed.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layer merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::LoadedConfig;
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(workspace_root: Option<&std::path::Path>) -> ConfigResult<LoadedConfig> {
        loader::load(workspace_root)
    }

    /// Load configuration from a single file layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
