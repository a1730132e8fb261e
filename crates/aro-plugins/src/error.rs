//! Load-time error types.
//!
//! Per-call failures are [`StructuredError`](crate::bridge::StructuredError)
//! values instead; nothing in this module is produced by an invocation.

use std::path::PathBuf;
use std::time::Duration;

use semver::{Version, VersionReq};
use thiserror::Error;

use crate::plugin::PluginId;

/// Errors raised while ordering plugins by their dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// A dependency names a plugin that is not in the candidate set.
    #[error("plugin {requester} depends on {missing} ({requirement}), which was not found")]
    MissingDependency {
        /// Plugin declaring the dependency.
        requester: PluginId,
        /// Name that could not be found.
        missing: String,
        /// Version requirement it was declared with.
        requirement: VersionReq,
    },

    /// A dependency exists but its version does not satisfy the requirement.
    #[error("plugin {requester} requires {dependency} {required}, found {found}")]
    VersionMismatch {
        /// Plugin declaring the dependency.
        requester: PluginId,
        /// Dependency name.
        dependency: PluginId,
        /// Declared requirement.
        required: VersionReq,
        /// Version actually present.
        found: Version,
    },

    /// The dependency graph contains a cycle. `path` starts and ends with
    /// the same plugin.
    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle {
        /// Plugins along the cycle, first element repeated at the end.
        path: Vec<PluginId>,
    },

    /// Two manifests declare the same plugin name.
    #[error("plugin {name} is declared twice ({} and {})", .first.display(), .second.display())]
    DuplicatePlugin {
        /// Duplicated name.
        name: PluginId,
        /// Directory of the first manifest.
        first: PathBuf,
        /// Directory of the second manifest.
        second: PathBuf,
    },

    /// A plugin was dropped because something it depends on failed.
    #[error("plugin {plugin} skipped because its dependency {dependency} failed")]
    DependencyFailed {
        /// Skipped plugin.
        plugin: PluginId,
        /// Dependency that failed first.
        dependency: PluginId,
    },
}

fn format_cycle(path: &[PluginId]) -> String {
    path.iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(" → ")
}

impl ResolutionError {
    /// The plugin whose load this error prevents.
    #[must_use]
    pub fn plugin(&self) -> &PluginId {
        match self {
            Self::MissingDependency { requester, .. } | Self::VersionMismatch { requester, .. } => {
                requester
            },
            Self::Cycle { path } => &path[0],
            Self::DuplicatePlugin { name, .. } => name,
            Self::DependencyFailed { plugin, .. } => plugin,
        }
    }
}

/// Errors that can occur while discovering, loading or registering a
/// plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A manifest is structurally invalid.
    #[error("invalid manifest at {}: {message}", .path.display())]
    InvalidManifest {
        /// Manifest file or plugin directory.
        path: PathBuf,
        /// What is wrong.
        message: String,
    },

    /// Invalid plugin id format.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// Dependency resolution failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A provider's artifact does not exist.
    #[error("plugin {plugin}: artifact not found at {}", .path.display())]
    ArtifactNotFound {
        /// Owning plugin.
        plugin: PluginId,
        /// Path that was looked up.
        path: PathBuf,
    },

    /// A compiled library could not be opened.
    #[error("plugin {plugin}: failed to open library: {message}")]
    LibraryLoad {
        /// Owning plugin.
        plugin: PluginId,
        /// Loader message.
        message: String,
    },

    /// A compiled library lacks a mandatory symbol.
    #[error("plugin {plugin}: missing entry point `{symbol}`")]
    MissingEntryPoint {
        /// Owning plugin.
        plugin: PluginId,
        /// Symbol name.
        symbol: &'static str,
    },

    /// A subprocess did not answer the metadata query in time.
    #[error("plugin {plugin}: handshake timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Owning plugin.
        plugin: PluginId,
        /// Configured handshake timeout.
        timeout: Duration,
    },

    /// A subprocess could not be spawned or answered the handshake with an
    /// error.
    #[error("plugin {plugin}: handshake failed: {message}")]
    HandshakeFailed {
        /// Owning plugin.
        plugin: PluginId,
        /// What went wrong.
        message: String,
    },

    /// The metadata returned by a provider is malformed or disagrees with
    /// the manifest.
    #[error("plugin {plugin}: malformed metadata: {message}")]
    MalformedMetadata {
        /// Owning plugin.
        plugin: PluginId,
        /// What is wrong.
        message: String,
    },

    /// Two plugins claim the same trigger verb.
    #[error("verb '{verb}' is claimed by both {first} and {second}")]
    VerbCollision {
        /// Contested verb.
        verb: String,
        /// Plugin registered first.
        first: PluginId,
        /// Plugin that tried to register it again.
        second: PluginId,
    },

    /// Two plugins export a qualifier with the same name.
    #[error("qualifier '{name}' is exported by both {first} and {second}")]
    QualifierCollision {
        /// Contested name.
        name: String,
        /// Plugin registered first.
        first: String,
        /// Plugin that tried to register it again.
        second: PluginId,
    },

    /// Two providers expose a system object with the same name.
    #[error("system object '{name}' is provided by both {first} and {second}")]
    ObjectCollision {
        /// Contested name.
        name: String,
        /// Owner registered first (`builtin` for built-in objects).
        first: String,
        /// Plugin that tried to register it again.
        second: PluginId,
    },

    /// Two built-in actions claim the same verb.
    #[error("built-in verb '{0}' is registered twice")]
    DuplicateBuiltin(String),

    /// A declarative source file failed validation.
    #[error("{}:{line}: {message}", .file.display())]
    Declarative {
        /// Source file.
        file: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What is wrong.
        message: String,
    },

    /// A plugin or provider is restricted to other platforms.
    #[error("plugin {plugin} supports {platforms:?}, not {current}")]
    UnsupportedPlatform {
        /// Owning plugin.
        plugin: PluginId,
        /// Declared platforms.
        platforms: Vec<String>,
        /// Platform we are running on.
        current: &'static str,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("plugin {plugin} is {state}, expected {expected}")]
    InvalidState {
        /// Owning plugin.
        plugin: PluginId,
        /// Current state.
        state: String,
        /// State the operation requires.
        expected: &'static str,
    },

    /// Plugin not found in the session.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] aro_config::ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Plugin the error is attributed to, when there is one.
    #[must_use]
    pub fn plugin(&self) -> Option<&PluginId> {
        match self {
            Self::ArtifactNotFound { plugin, .. }
            | Self::LibraryLoad { plugin, .. }
            | Self::MissingEntryPoint { plugin, .. }
            | Self::HandshakeTimeout { plugin, .. }
            | Self::HandshakeFailed { plugin, .. }
            | Self::MalformedMetadata { plugin, .. }
            | Self::UnsupportedPlatform { plugin, .. }
            | Self::InvalidState { plugin, .. } => Some(plugin),
            Self::VerbCollision { second, .. }
            | Self::QualifierCollision { second, .. }
            | Self::ObjectCollision { second, .. } => Some(second),
            Self::Resolution(e) => Some(e.plugin()),
            _ => None,
        }
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    #[test]
    fn test_cycle_display_names_full_path() {
        let err = ResolutionError::Cycle {
            path: vec![id("a"), id("b"), id("a")],
        };
        assert_eq!(err.to_string(), "dependency cycle: a → b → a");
        assert_eq!(err.plugin().as_str(), "a");
    }

    #[test]
    fn test_verb_collision_names_both_plugins() {
        let err = PluginError::VerbCollision {
            verb: "parse".into(),
            first: id("csv"),
            second: id("tsv"),
        };
        let msg = err.to_string();
        assert!(msg.contains("parse"));
        assert!(msg.contains("csv"));
        assert!(msg.contains("tsv"));
        assert_eq!(err.plugin().map(PluginId::as_str), Some("tsv"));
    }
}
