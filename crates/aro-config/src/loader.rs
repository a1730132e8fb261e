//! Config file discovery and layered loading.
//!
//! 1. Parse the embedded `defaults.toml`
//! 2. Merge `~/.aro/config.toml` (user)
//! 3. Merge `{workspace}/.aro/config.toml` (workspace)
//! 4. Apply `ARO_*` environment overrides
//! 5. Deserialize and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::deep_merge;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Directory name holding config files under the home and workspace roots.
pub const CONFIG_DIR: &str = ".aro";

/// A loaded configuration together with the files that contributed to it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The validated configuration.
    pub config: Config,
    /// Files merged on top of the defaults, lowest precedence first.
    pub loaded_files: Vec<PathBuf>,
    /// Number of fields set from `ARO_*` variables.
    pub env_overrides: usize,
}

/// Load configuration from the process environment and home directory.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the home directory cannot be found, any file
/// is malformed, or the merged result fails validation.
pub fn load(workspace_root: Option<&Path>) -> ConfigResult<LoadedConfig> {
    let home = home_directory()?;
    load_with(workspace_root, Some(&home), &collect_env_vars())
}

/// Load configuration with an explicit home directory and variable map.
///
/// `home_dir` of `None` skips the user layer.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any file is malformed or the merged result
/// fails validation.
pub fn load_with(
    workspace_root: Option<&Path>,
    home_dir: Option<&Path>,
    env: &HashMap<String, String>,
) -> ConfigResult<LoadedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    let layers = [
        ("user", home_dir.map(|h| h.join(CONFIG_DIR).join("config.toml"))),
        (
            "workspace",
            workspace_root.map(|w| w.join(CONFIG_DIR).join("config.toml")),
        ),
    ];
    for (layer, path) in layers {
        let Some(path) = path else { continue };
        if let Some(overlay) = try_load_file(&path)? {
            deep_merge(&mut merged, &overlay);
            info!(layer, path = %path.display(), "loaded config layer");
            loaded_files.push(path);
        }
    }

    let env_overrides = apply_env_overrides(&mut merged, env)?;
    if env_overrides > 0 {
        debug!(count = env_overrides, "applied environment overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;
    validate::validate(&config)?;

    Ok(LoadedConfig {
        config,
        loaded_files,
        env_overrides,
    })
}

/// Load a config from a single file on top of the defaults (no other
/// layers, no environment).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is missing, unreadable, malformed,
/// or fails validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    deep_merge(&mut merged, &overlay);
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: path.display().to_string(),
                source: e,
            })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Read and parse a TOML file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
