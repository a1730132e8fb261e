//! System object protocol.
//!
//! A system object is a named I/O endpoint (`env`, `memory`, `console`,
//! `redis`, ...) that supports some of `read`, `write` and `list`. Which
//! ones is declared up front as a [`CapabilitySet`]; an operation the object
//! does not declare fails with `permission-denied` before the object is
//! touched.
//!
//! Objects come from two places: built-ins registered by the runtime, and
//! plugin providers that declare `system_objects`. Plugin objects are served
//! by their host through [`PluginHost::object_read`] and friends.
//!
//! [`PluginHost::object_read`]: crate::host::PluginHost::object_read

mod builtin;
mod capability;
mod table;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::bridge::{InvocationResult, StructuredError};
use crate::manifest::ConfigSource;

pub use builtin::{EnvObject, MemoryObject};
pub use capability::{Capability, CapabilitySet};
pub use table::SystemObjectTable;

/// One object operation as it crosses the host boundary.
///
/// For `list`, `qualifier` carries the glob pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectRequest {
    /// Object name.
    pub object: String,
    /// Key, path or pattern the operation applies to.
    pub qualifier: String,
    /// Value to write. `Null` for read and list.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Free-form options.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    /// Resolved config values.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// A system object implementation.
///
/// Every operation defaults to the capability error, so implementations
/// only override what they support.
#[async_trait]
pub trait SystemObject: Send + Sync {
    /// Object name.
    fn name(&self) -> &str;

    /// Operations the object supports.
    fn capabilities(&self) -> CapabilitySet;

    /// Read the value at `request.qualifier`.
    async fn read(&self, request: &ObjectRequest) -> InvocationResult {
        Err(StructuredError::missing_capability(
            &request.object,
            Capability::Readable.as_str(),
        ))
    }

    /// Write `request.payload` at `request.qualifier`.
    async fn write(&self, request: &ObjectRequest) -> InvocationResult {
        Err(StructuredError::missing_capability(
            &request.object,
            Capability::Writable.as_str(),
        ))
    }

    /// List entries matching the glob in `request.qualifier`.
    async fn list(&self, request: &ObjectRequest) -> InvocationResult {
        Err(StructuredError::missing_capability(
            &request.object,
            Capability::Enumerable.as_str(),
        ))
    }
}

/// Source of environment variables for object config and the `env` object.
pub trait EnvSource: Send + Sync {
    /// Value of `name`, if set.
    fn var(&self, name: &str) -> Option<String>;

    /// All variables.
    fn vars(&self) -> Vec<(String, String)>;
}

/// The process environment, read at call time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn vars(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }
}

/// A fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    /// Create from any key/value iterator.
    pub fn new<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }

    fn vars(&self) -> Vec<(String, String)> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Per-invocation instance of a system object, from
/// [`SystemObjectTable::open`].
///
/// Config keys are resolved from the environment on the first operation
/// and then reused for the handle's lifetime.
pub struct ObjectHandle {
    name: String,
    object: Arc<dyn SystemObject>,
    capabilities: CapabilitySet,
    config_sources: BTreeMap<String, ConfigSource>,
    env: Arc<dyn EnvSource>,
    config: OnceLock<BTreeMap<String, String>>,
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("config_keys", &self.config_sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ObjectHandle {
    /// Object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Read the value at `qualifier`.
    ///
    /// # Errors
    ///
    /// `permission-denied` when the object is not readable, otherwise
    /// whatever the object reports.
    pub async fn read(&self, qualifier: &str, options: Map<String, Value>) -> InvocationResult {
        self.require(Capability::Readable)?;
        let request = self.request(qualifier, Value::Null, options);
        self.object.read(&request).await
    }

    /// Write `payload` at `qualifier`.
    ///
    /// # Errors
    ///
    /// `permission-denied` when the object is not writable, otherwise
    /// whatever the object reports.
    pub async fn write(
        &self,
        qualifier: &str,
        payload: Value,
        options: Map<String, Value>,
    ) -> InvocationResult {
        self.require(Capability::Writable)?;
        let request = self.request(qualifier, payload, options);
        self.object.write(&request).await
    }

    /// List entries matching `pattern` (glob syntax; empty means all).
    ///
    /// # Errors
    ///
    /// `permission-denied` when the object is not enumerable, otherwise
    /// whatever the object reports.
    pub async fn list(&self, pattern: &str, options: Map<String, Value>) -> InvocationResult {
        self.require(Capability::Enumerable)?;
        let request = self.request(pattern, Value::Null, options);
        self.object.list(&request).await
    }

    fn require(&self, capability: Capability) -> Result<(), StructuredError> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(StructuredError::missing_capability(
                &self.name,
                capability.as_str(),
            ))
        }
    }

    fn request(&self, qualifier: &str, payload: Value, options: Map<String, Value>) -> ObjectRequest {
        ObjectRequest {
            object: self.name.clone(),
            qualifier: qualifier.to_owned(),
            payload,
            options,
            config: self.config().clone(),
        }
    }

    fn config(&self) -> &BTreeMap<String, String> {
        self.config.get_or_init(|| {
            resolve_config(&self.name, &self.config_sources, self.env.as_ref())
        })
    }
}

fn resolve_config(
    object: &str,
    sources: &BTreeMap<String, ConfigSource>,
    env: &dyn EnvSource,
) -> BTreeMap<String, String> {
    let mut resolved = BTreeMap::new();
    for (key, source) in sources {
        let value = match source {
            ConfigSource::Literal(value) => Some(value.clone()),
            ConfigSource::Env { env: var, default } => env.var(var).or_else(|| default.clone()),
        };
        match value {
            Some(value) => {
                resolved.insert(key.clone(), value);
            },
            None => debug!(object, key = %key, "config value unset and has no default"),
        }
    }
    resolved
}
