//! Plugin manifest model.
//!
//! A manifest (`plugin.toml`) names the plugin, its version, the providers
//! that implement it and the plugins it depends on. Parsing operates on a
//! decoded key/value tree so the same validation applies whatever syntax
//! the tree came from.
//!
//! ```toml
//! name = "plugin-rust-csv"
//! version = "1.0.0"
//!
//! [[provides]]
//! type = "compiled-library"
//! path = "target/release/libplugin_rust_csv"
//!
//! [dependencies]
//! plugin-core = { version = "^1.0", source = "git+https://example.org/core" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use aro_config::RestartPolicy;
use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{PluginError, PluginResult};
use crate::objects::CapabilitySet;
use crate::plugin::PluginId;

/// Suffix that marks a declarative unit as an event handler.
pub const DEFAULT_HANDLER_SUFFIX: &str = "Handler";

/// Lowercase `name` and drop `-`, `_` and spaces, so `parse-csv`,
/// `parse_csv` and `ParseCSV` compare equal.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Operating system name used for platform qualifiers.
#[must_use]
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

fn platform_matches(declared: &[String], current: &str) -> bool {
    declared.is_empty()
        || declared.iter().any(|p| {
            let p = p.to_ascii_lowercase();
            p == current || (p == "darwin" && current == "macos")
        })
}

// ---------------------------------------------------------------------------
// Actions, qualifiers, system objects
// ---------------------------------------------------------------------------

/// Conventional role of an action in the calling language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRole {
    /// Brings data in (`Extract`, `Retrieve`, ...).
    #[serde(alias = "request")]
    Inbound,
    /// Transforms data already held.
    #[default]
    #[serde(alias = "own")]
    Internal,
    /// Sends data out (`Return`, `Send`, ...).
    #[serde(alias = "response")]
    Outbound,
    /// Publishes data for other feature sets.
    Export,
}

/// An action a provider exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Name passed back to the provider's execute entry point.
    pub name: String,
    /// Conventional role.
    #[serde(default)]
    pub role: ActionRole,
    /// Lowercased trigger verbs. Empty for actions that are only reachable
    /// as `service:method`.
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Prepositions the verb may be used with. Empty means any.
    #[serde(default)]
    pub prepositions: Vec<String>,
    /// Optional JSON schema for the arguments.
    #[serde(default, alias = "schema", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl ActionSpec {
    /// Action declared by name only: internal role, one verb derived from
    /// the name (`to-html` → `tohtml`).
    #[must_use]
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            verbs: vec![normalize_name(&name)],
            name,
            role: ActionRole::Internal,
            prepositions: Vec::new(),
            arguments: None,
        }
    }

    /// Action with no verbs, reachable only as a service method.
    #[must_use]
    pub fn method_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: ActionRole::Internal,
            verbs: Vec::new(),
            prepositions: Vec::new(),
            arguments: None,
        }
    }

    /// Lowercase verbs and prepositions and drop duplicates. An action with
    /// no verbs gets one derived from its name.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.verbs.is_empty() {
            self.verbs.push(normalize_name(&self.name));
        }
        self.verbs = dedup_lowercase(self.verbs);
        self.prepositions = dedup_lowercase(self.prepositions);
        self
    }

    /// Whether `preposition` may be used with this action's verbs.
    #[must_use]
    pub fn allows_preposition(&self, preposition: &str) -> bool {
        self.prepositions.is_empty()
            || self
                .prepositions
                .iter()
                .any(|p| p.eq_ignore_ascii_case(preposition))
    }
}

fn dedup_lowercase(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// Accept both `"to-html"` and `{ name = "ToHtml", ... }` entries.
fn deserialize_actions<'de, D>(deserializer: D) -> Result<Vec<ActionSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Name(String),
        Full(ActionSpec),
    }
    let entries = Vec::<Entry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            Entry::Name(name) => ActionSpec::from_name(name),
            Entry::Full(spec) => spec.normalized(),
        })
        .collect())
}

/// A value transformer a provider exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualifierSpec {
    /// Qualifier name.
    pub name: String,
    /// Type names the qualifier accepts (`List`, `String`, ...). Empty
    /// means any.
    #[serde(default, alias = "inputTypes")]
    pub input_types: Vec<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QualifierSpec {
    /// Whether the qualifier accepts values of `type_name`.
    #[must_use]
    pub fn accepts(&self, type_name: &str) -> bool {
        self.input_types.is_empty()
            || self
                .input_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(type_name))
    }
}

/// Where a system object's config value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigSource {
    /// Read an environment variable at first use, with an optional
    /// fallback.
    Env {
        /// Variable name.
        env: String,
        /// Value when the variable is unset.
        #[serde(default)]
        default: Option<String>,
    },
    /// A fixed value.
    Literal(String),
}

/// A system object a provider exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemObjectSpec {
    /// Object name (`console`, `redis`, ...).
    pub name: String,
    /// Supported operations.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Logical config key → source.
    #[serde(default)]
    pub config: BTreeMap<String, ConfigSource>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A subscription to a named event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Event name (`UserCreated`).
    pub event: String,
    /// Unit or action invoked when the event fires. Defaults to the event
    /// name itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl EventSubscription {
    /// Name passed to the provider's execute entry point.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.event)
    }
}

/// Accept both `"UserCreated"` and `{ event = "UserCreated", handler = ... }`.
fn deserialize_events<'de, D>(deserializer: D) -> Result<Vec<EventSubscription>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Name(String),
        Full(EventSubscription),
    }
    let entries = Vec::<Entry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            Entry::Name(event) => EventSubscription {
                event,
                handler: None,
            },
            Entry::Full(sub) => sub,
        })
        .collect())
}

/// What a provider reports about itself once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Name the provider reports. Informational; the manifest name wins.
    #[serde(default)]
    pub name: String,
    /// Version the provider reports.
    #[serde(default)]
    pub version: Option<String>,
    /// Exported actions.
    #[serde(default, deserialize_with = "deserialize_actions")]
    pub actions: Vec<ActionSpec>,
    /// Exported qualifiers.
    #[serde(default)]
    pub qualifiers: Vec<QualifierSpec>,
    /// Exposed system objects.
    #[serde(default, alias = "systemObjects")]
    pub system_objects: Vec<SystemObjectSpec>,
    /// Events the provider subscribes to.
    #[serde(default, deserialize_with = "deserialize_events")]
    pub events: Vec<EventSubscription>,
}

impl PluginMetadata {
    /// Decode a metadata-query response.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedMetadata`] if the value does not
    /// have the expected shape or names an action twice.
    pub fn from_value(plugin: &PluginId, value: Value) -> PluginResult<Self> {
        let metadata: Self =
            serde_json::from_value(value).map_err(|e| PluginError::MalformedMetadata {
                plugin: plugin.clone(),
                message: e.to_string(),
            })?;
        let mut names = HashSet::new();
        for action in &metadata.actions {
            if action.name.is_empty() {
                return Err(PluginError::MalformedMetadata {
                    plugin: plugin.clone(),
                    message: "action with empty name".into(),
                });
            }
            if !names.insert(normalize_name(&action.name)) {
                return Err(PluginError::MalformedMetadata {
                    plugin: plugin.clone(),
                    message: format!("action '{}' is listed twice", action.name),
                });
            }
        }
        Ok(metadata)
    }

    /// Merge manifest declarations into the reported metadata.
    ///
    /// Every action the manifest declares must be exported by the provider;
    /// the manifest's declaration (verbs, prepositions, role) then replaces
    /// the reported one. Declared system objects are added when the provider
    /// did not report them.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedMetadata`] for a declared action the
    /// provider does not export.
    pub fn reconcile(mut self, plugin: &PluginId, provider: &ProviderSpec) -> PluginResult<Self> {
        for declared in &provider.actions {
            let key = normalize_name(&declared.name);
            let Some(slot) = self
                .actions
                .iter_mut()
                .find(|a| normalize_name(&a.name) == key)
            else {
                return Err(PluginError::MalformedMetadata {
                    plugin: plugin.clone(),
                    message: format!(
                        "manifest declares action '{}' but the provider does not export it",
                        declared.name
                    ),
                });
            };
            let reported_name = std::mem::take(&mut slot.name);
            *slot = ActionSpec {
                name: reported_name,
                ..declared.clone()
            };
        }
        for object in &provider.system_objects {
            if !self.system_objects.iter().any(|o| o.name == object.name) {
                self.system_objects.push(object.clone());
            }
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Implementation-specific half of a provider declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Natively compiled dynamic library loaded in process.
    CompiledLibrary {
        /// Library path relative to the plugin directory. The platform
        /// extension is appended when missing.
        path: PathBuf,
        /// Build parameters for external tooling. Not interpreted here.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        build: Option<Value>,
    },
    /// Long-lived child process speaking JSON lines on stdio.
    Subprocess {
        /// Program to run. Resolved via `PATH` when not a path.
        command: String,
        /// Program arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment for the child.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory relative to the plugin directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        /// Overrides `subprocess.handshake_timeout_ms`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handshake_timeout_ms: Option<u64>,
        /// Overrides `subprocess.call_timeout_ms`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_timeout_ms: Option<u64>,
        /// Overrides `subprocess.restart`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<RestartPolicy>,
    },
    /// Directory or file list of declarative `.aro` sources.
    Declarative {
        /// Directory (or single file) relative to the plugin directory.
        path: PathBuf,
        /// Unit-name suffix marking event handlers.
        #[serde(default = "default_handler_suffix")]
        handler_suffix: String,
    },
}

fn default_handler_suffix() -> String {
    DEFAULT_HANDLER_SUFFIX.to_owned()
}

/// Discriminant of [`ProviderKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    /// [`ProviderKind::CompiledLibrary`].
    CompiledLibrary,
    /// [`ProviderKind::Subprocess`].
    Subprocess,
    /// [`ProviderKind::Declarative`].
    Declarative,
}

impl std::fmt::Display for HostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CompiledLibrary => "compiled-library",
            Self::Subprocess => "subprocess",
            Self::Declarative => "declarative",
        })
    }
}

/// One implementation unit of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Variant and its parameters.
    #[serde(flatten)]
    pub kind: ProviderKind,
    /// Platforms this provider is built for. Empty means all.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Actions the provider is expected to export.
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    /// System objects the provider exposes.
    #[serde(default, alias = "systemObjects")]
    pub system_objects: Vec<SystemObjectSpec>,
}

impl ProviderSpec {
    /// Which host runs this provider.
    #[must_use]
    pub fn host_kind(&self) -> HostKind {
        match self.kind {
            ProviderKind::CompiledLibrary { .. } => HostKind::CompiledLibrary,
            ProviderKind::Subprocess { .. } => HostKind::Subprocess,
            ProviderKind::Declarative { .. } => HostKind::Declarative,
        }
    }

    /// Whether the provider runs on `platform`.
    #[must_use]
    pub fn supports_platform(&self, platform: &str) -> bool {
        platform_matches(&self.platforms, platform)
    }

    fn validate(&mut self, path: &Path) -> PluginResult<()> {
        let invalid = |message: String| PluginError::InvalidManifest {
            path: path.to_path_buf(),
            message,
        };
        match &self.kind {
            ProviderKind::CompiledLibrary { path: p, .. } | ProviderKind::Declarative { path: p, .. }
                if p.as_os_str().is_empty() =>
            {
                return Err(invalid(format!("{} provider has an empty path", self.host_kind())));
            },
            ProviderKind::Subprocess { command, .. } if command.trim().is_empty() => {
                return Err(invalid("subprocess provider has an empty command".into()));
            },
            ProviderKind::Subprocess {
                handshake_timeout_ms: Some(0),
                ..
            }
            | ProviderKind::Subprocess {
                call_timeout_ms: Some(0),
                ..
            } => {
                return Err(invalid("subprocess timeouts must be greater than zero".into()));
            },
            _ => {},
        }
        // Only worker processes answer `object.*` requests.
        if !self.system_objects.is_empty() && self.host_kind() != HostKind::Subprocess {
            return Err(invalid(format!(
                "{} providers cannot expose system objects",
                self.host_kind()
            )));
        }
        self.actions = std::mem::take(&mut self.actions)
            .into_iter()
            .map(ActionSpec::normalized)
            .collect();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A dependency on another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRef {
    /// Plugin depended on.
    pub name: PluginId,
    /// Accepted versions.
    pub requirement: VersionReq,
    /// Where the dependency can be fetched from. Informational here.
    pub source: Option<String>,
}

/// Parsed, validated manifest. Immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    /// Unique plugin name.
    pub name: PluginId,
    /// Plugin version.
    pub version: Version,
    /// Human-readable description.
    pub description: Option<String>,
    /// Author.
    pub author: Option<String>,
    /// Implementation units, in declaration order.
    pub providers: Vec<ProviderSpec>,
    /// Dependencies, sorted by name.
    pub dependencies: Vec<DependencyRef>,
    /// Platforms the whole plugin supports. Empty means all.
    pub platforms: Vec<String>,
    /// Directory the manifest was found in. Provider paths are relative
    /// to it.
    pub root: PathBuf,
}

#[derive(Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default, alias = "provider")]
    provides: Vec<ProviderSpec>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(default)]
    platforms: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Requirement(String),
    Detailed {
        #[serde(default = "any_version")]
        version: String,
        #[serde(default, alias = "git")]
        source: Option<String>,
    },
}

fn any_version() -> String {
    "*".to_owned()
}

impl PluginDescriptor {
    /// Build a descriptor from an already decoded key/value tree.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] when required fields are
    /// missing, the version or a requirement is not valid semver, or no
    /// provider is declared.
    pub fn from_value(value: Value, root: impl Into<PathBuf>) -> PluginResult<Self> {
        let root = root.into();
        let raw: RawManifest =
            serde_json::from_value(value).map_err(|e| PluginError::InvalidManifest {
                path: root.clone(),
                message: e.to_string(),
            })?;
        raw.validate(root)
    }

    /// Parse TOML manifest text.
    ///
    /// # Errors
    ///
    /// Same as [`from_value`](Self::from_value), plus TOML syntax errors.
    pub fn from_toml_str(text: &str, root: impl Into<PathBuf>) -> PluginResult<Self> {
        let root = root.into();
        let raw: RawManifest = toml::from_str(text).map_err(|e| PluginError::InvalidManifest {
            path: root.clone(),
            message: e.to_string(),
        })?;
        raw.validate(root)
    }

    /// Read and parse a manifest file. The plugin root is the file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(manifest_path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(manifest_path)?;
        let root = manifest_path
            .parent()
            .map_or_else(PathBuf::new, Path::to_path_buf);
        Self::from_toml_str(&text, root).map_err(|e| match e {
            PluginError::InvalidManifest { message, .. } => PluginError::InvalidManifest {
                path: manifest_path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Whether the plugin as a whole runs on `platform`.
    #[must_use]
    pub fn supports_platform(&self, platform: &str) -> bool {
        platform_matches(&self.platforms, platform)
    }

    /// Resolve a provider-relative path against the plugin root.
    #[must_use]
    pub fn resolve_path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }
}

impl RawManifest {
    fn validate(self, root: PathBuf) -> PluginResult<PluginDescriptor> {
        let invalid = |message: String| PluginError::InvalidManifest {
            path: root.clone(),
            message,
        };

        let name = PluginId::new(self.name).map_err(|e| invalid(e.to_string()))?;
        let version = Version::parse(&self.version)
            .map_err(|e| invalid(format!("version '{}' is not valid semver: {e}", self.version)))?;

        if self.provides.is_empty() {
            return Err(invalid(format!("plugin {name} declares no providers")));
        }
        let mut providers = self.provides;
        for provider in &mut providers {
            provider.validate(&root)?;
        }

        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for (dep_name, raw) in self.dependencies {
            let (requirement, source) = match raw {
                RawDependency::Requirement(r) => (r, None),
                RawDependency::Detailed { version, source } => (version, source),
            };
            let dep_id = PluginId::new(dep_name).map_err(|e| invalid(e.to_string()))?;
            let requirement = VersionReq::parse(&requirement).map_err(|e| {
                invalid(format!(
                    "dependency {dep_id}: requirement '{requirement}' is not valid: {e}"
                ))
            })?;
            dependencies.push(DependencyRef {
                name: dep_id,
                requirement,
                source,
            });
        }

        Ok(PluginDescriptor {
            name,
            version,
            description: self.description,
            author: self.author,
            providers,
            dependencies,
            platforms: self.platforms,
            root,
        })
    }
}
