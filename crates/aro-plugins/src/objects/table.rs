//! The system object table.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::debug;

use super::{
    CapabilitySet, EnvObject, EnvSource, MemoryObject, ObjectHandle, ObjectRequest, SystemObject,
};
use crate::bridge::{InvocationResult, StructuredError};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::manifest::{ConfigSource, SystemObjectSpec};
use crate::plugin::PluginId;

const BUILTIN_OWNER: &str = "builtin";

#[derive(Clone)]
struct Entry {
    object: Arc<dyn SystemObject>,
    capabilities: CapabilitySet,
    config: BTreeMap<String, ConfigSource>,
    owner: Option<PluginId>,
}

impl Entry {
    fn owner_name(&self) -> String {
        self.owner
            .as_ref()
            .map_or_else(|| BUILTIN_OWNER.to_owned(), ToString::to_string)
    }
}

/// Name → system object, built during the load phase and read-only after.
#[derive(Clone, Default)]
pub struct SystemObjectTable {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for SystemObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, e.owner_name())))
            .finish()
    }
}

impl SystemObjectTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding the built-in `env` and `memory` objects.
    #[must_use]
    pub fn with_builtins(env: Arc<dyn EnvSource>) -> Self {
        let mut table = Self::new();
        for object in [
            Arc::new(EnvObject::new(env)) as Arc<dyn SystemObject>,
            Arc::new(MemoryObject::new()),
        ] {
            let name = object.name().to_owned();
            table.entries.insert(
                name,
                Entry {
                    capabilities: object.capabilities(),
                    object,
                    config: BTreeMap::new(),
                    owner: None,
                },
            );
        }
        table
    }

    /// Register a built-in object.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateBuiltin`] if the name is taken.
    pub fn register_builtin(&mut self, object: Arc<dyn SystemObject>) -> PluginResult<()> {
        let name = object.name().to_owned();
        if self.entries.contains_key(&name) {
            return Err(PluginError::DuplicateBuiltin(name));
        }
        self.entries.insert(
            name,
            Entry {
                capabilities: object.capabilities(),
                object,
                config: BTreeMap::new(),
                owner: None,
            },
        );
        Ok(())
    }

    /// Register every object a plugin exposes, all or none.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ObjectCollision`] if any name is already
    /// taken; the table is unchanged in that case.
    pub fn register_plugin(
        &mut self,
        plugin: &PluginId,
        host: &Arc<dyn PluginHost>,
        specs: &[SystemObjectSpec],
    ) -> PluginResult<()> {
        let mut seen = HashSet::new();
        for spec in specs {
            if let Some(existing) = self.entries.get(&spec.name) {
                return Err(PluginError::ObjectCollision {
                    name: spec.name.clone(),
                    first: existing.owner_name(),
                    second: plugin.clone(),
                });
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(PluginError::ObjectCollision {
                    name: spec.name.clone(),
                    first: plugin.to_string(),
                    second: plugin.clone(),
                });
            }
        }

        for spec in specs {
            debug!(plugin = %plugin, object = %spec.name, "registering system object");
            self.entries.insert(
                spec.name.clone(),
                Entry {
                    object: Arc::new(HostObject {
                        name: spec.name.clone(),
                        capabilities: spec.capabilities.clone(),
                        host: Arc::clone(host),
                    }),
                    capabilities: spec.capabilities.clone(),
                    config: spec.config.clone(),
                    owner: Some(plugin.clone()),
                },
            );
        }
        Ok(())
    }

    /// Copy of the table without the objects `plugin` registered.
    #[must_use]
    pub fn without_plugin(&self, plugin: &PluginId) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(_, e)| e.owner.as_ref() != Some(plugin))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
        }
    }

    /// Open a per-invocation handle on `name`.
    ///
    /// # Errors
    ///
    /// Returns an `action-not-found` error for an unknown object.
    pub fn open(&self, name: &str, env: Arc<dyn EnvSource>) -> Result<ObjectHandle, StructuredError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StructuredError::not_found("system object", name))?;
        Ok(ObjectHandle {
            name: name.to_owned(),
            object: Arc::clone(&entry.object),
            capabilities: entry.capabilities.clone(),
            config_sources: entry.config.clone(),
            env,
            config: OnceLock::new(),
        })
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Plugin that provides `name`; `None` for built-ins and unknown names.
    #[must_use]
    pub fn owner(&self, name: &str) -> Option<&PluginId> {
        self.entries.get(name).and_then(|e| e.owner.as_ref())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Plugin-provided object served through its host.
struct HostObject {
    name: String,
    capabilities: CapabilitySet,
    host: Arc<dyn PluginHost>,
}

#[async_trait]
impl SystemObject for HostObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn read(&self, request: &ObjectRequest) -> InvocationResult {
        self.host.object_read(request).await
    }

    async fn write(&self, request: &ObjectRequest) -> InvocationResult {
        self.host.object_write(request).await
    }

    async fn list(&self, request: &ObjectRequest) -> InvocationResult {
        self.host.object_list(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ErrorCode;
    use crate::host::testing::RecordingHost;
    use crate::objects::{Capability, MapEnv};
    use serde_json::{Map, json};

    fn env() -> Arc<dyn EnvSource> {
        Arc::new(MapEnv::new([("CONSOLE_PREFIX", "> ")]))
    }

    fn console_spec() -> SystemObjectSpec {
        serde_json::from_value(json!({
            "name": "console",
            "capabilities": ["writable"],
            "config": { "prefix": { "env": "CONSOLE_PREFIX" } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_on_write_only_object_is_not_readable() {
        let plugin = PluginId::new("console").unwrap();
        let host: Arc<dyn PluginHost> = Arc::new(RecordingHost::new("console"));
        let mut table = SystemObjectTable::with_builtins(env());
        table.register_plugin(&plugin, &host, &[console_spec()]).unwrap();

        let handle = table.open("console", env()).unwrap();
        let err = handle.read("stdout", Map::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert_eq!(err.message, "console is not readable");
        assert_eq!(err.detail["capability"], "readable");
    }

    #[tokio::test]
    async fn test_plugin_object_routes_through_host_with_config() {
        let plugin = PluginId::new("console").unwrap();
        let recording = Arc::new(RecordingHost::new("console"));
        let host: Arc<dyn PluginHost> = recording.clone();
        let mut table = SystemObjectTable::new();
        table.register_plugin(&plugin, &host, &[console_spec()]).unwrap();

        let handle = table.open("console", env()).unwrap();
        handle.write("stdout", json!("hi"), Map::new()).await.unwrap();

        let calls = recording.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "object.write");
        assert_eq!(calls[0].1["qualifier"], "stdout");
        assert_eq!(calls[0].1["payload"], "hi");
        assert_eq!(calls[0].1["config"]["prefix"], "> ");
    }

    #[test]
    fn test_collision_with_builtin_and_atomicity() {
        let plugin = PluginId::new("shadow").unwrap();
        let host: Arc<dyn PluginHost> = Arc::new(RecordingHost::new("shadow"));
        let mut table = SystemObjectTable::with_builtins(env());
        let specs = [
            console_spec(),
            SystemObjectSpec {
                name: "memory".into(),
                capabilities: CapabilitySet::empty().with(Capability::Readable),
                config: BTreeMap::new(),
                description: None,
            },
        ];
        let err = table.register_plugin(&plugin, &host, &specs).unwrap_err();
        assert!(matches!(
            err,
            PluginError::ObjectCollision { ref name, ref first, .. } if name == "memory" && first == "builtin"
        ));
        assert!(!table.contains("console"));
    }

    #[test]
    fn test_without_plugin_and_unknown_object() {
        let plugin = PluginId::new("console").unwrap();
        let host: Arc<dyn PluginHost> = Arc::new(RecordingHost::new("console"));
        let mut table = SystemObjectTable::with_builtins(env());
        table.register_plugin(&plugin, &host, &[console_spec()]).unwrap();
        assert_eq!(table.owner("console"), Some(&plugin));

        let trimmed = table.without_plugin(&plugin);
        assert!(!trimmed.contains("console"));
        assert!(trimmed.contains("env"));
        assert_eq!(trimmed.names().collect::<Vec<_>>(), vec!["env", "memory"]);

        let err = trimmed.open("console", env()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ActionNotFound);
    }
}
