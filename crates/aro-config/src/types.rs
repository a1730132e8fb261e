//! Configuration struct definitions.
//!
//! Every section uses `#[serde(default)]` so a partial file only needs to
//! name the fields it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a plugin runtime session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery and load policy.
    pub plugins: PluginsSection,
    /// Subprocess host timeouts and restart policy.
    pub subprocess: SubprocessSection,
    /// Compiled-library host settings.
    pub native: NativeSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// What the loader does when one plugin fails to resolve or load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// The first failure aborts the whole session.
    Abort,
    /// The failing plugin (and anything depending on it) is skipped with a
    /// warning.
    #[default]
    Skip,
}

/// Precedence rule when a plugin verb matches a built-in verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinShadowing {
    /// The plugin takes the verb only when its action role equals the
    /// built-in's role. Otherwise the built-in keeps it.
    #[default]
    RoleCompatible,
    /// Built-ins always keep their verbs.
    Never,
}

/// Plugin discovery and load policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directories scanned for plugin manifests, in order.
    pub directories: Vec<PathBuf>,
    /// Manifest file name looked up in each plugin directory.
    pub manifest_file: String,
    /// Abort or skip on a per-plugin failure.
    pub load_failure_policy: LoadFailurePolicy,
    /// Built-in vs. plugin verb precedence.
    pub builtin_shadowing: BuiltinShadowing,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directories: vec![PathBuf::from("Plugins")],
            manifest_file: "plugin.toml".to_owned(),
            load_failure_policy: LoadFailurePolicy::default(),
            builtin_shadowing: BuiltinShadowing::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// SubprocessSection
// ---------------------------------------------------------------------------

/// Restart policy for a subprocess worker that crashed or became unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Never restart; the plugin stays terminated.
    #[default]
    Never,
    /// Restart up to `max_retries` times over the life of the session.
    OnFailure {
        /// Restart budget.
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    /// Always restart.
    Always,
}

fn default_max_retries() -> u32 {
    3
}

impl RestartPolicy {
    /// Whether a restart is allowed after `restarts_so_far` restarts.
    #[must_use]
    pub fn allows(&self, restarts_so_far: u32) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure { max_retries } => restarts_so_far < *max_retries,
            Self::Always => true,
        }
    }
}

/// Subprocess host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessSection {
    /// How long a freshly spawned worker has to answer the metadata query.
    pub handshake_timeout_ms: u64,
    /// Default per-call timeout.
    pub call_timeout_ms: u64,
    /// Grace period between the shutdown request and a hard kill.
    pub shutdown_timeout_ms: u64,
    /// Consecutive call timeouts after which the worker is considered
    /// unhealthy.
    pub max_consecutive_timeouts: u32,
    /// What to do with an unhealthy or crashed worker.
    pub restart: RestartPolicy,
}

impl Default for SubprocessSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            shutdown_timeout_ms: 2_000,
            max_consecutive_timeouts: 3,
            restart: RestartPolicy::default(),
        }
    }
}

impl SubprocessSection {
    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// NativeSection
// ---------------------------------------------------------------------------

/// Compiled-library host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSection {
    /// How long a caller waits for a native call before giving up. The call
    /// itself keeps running on its blocking thread.
    pub call_timeout_ms: u64,
}

impl Default for NativeSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl NativeSection {
    /// Per-call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["aro_plugins=debug"]`).
    pub directives: Vec<String>,
    /// Write logs to rolling files in this directory instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            directory: None,
        }
    }
}
