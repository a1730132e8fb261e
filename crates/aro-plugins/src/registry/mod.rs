//! Action, service, qualifier and event registry.
//!
//! Built once per session by a [`RegistryBuilder`]: built-ins first, then
//! each plugin in load order. The finished [`Registry`] is shared behind an
//! `Arc` and never mutated; unloading a plugin produces a new snapshot.

mod actions;
mod events;
mod qualifiers;
mod services;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use aro_config::BuiltinShadowing;

use crate::bridge::StructuredError;
use crate::error::PluginResult;
use crate::host::PluginHost;
use crate::manifest::{ActionSpec, QualifierSpec};
use crate::plugin::PluginId;

pub use actions::{ActionTable, ActionTarget, BuiltinAction, ResolvedAction};
pub use events::{EventIndex, Subscriber};
pub use qualifiers::{QualifierTable, RegisteredQualifier};
pub use services::{ServiceCall, ServiceMethod, ServiceTable};

/// Read-only lookup tables for one session.
#[derive(Clone, Default)]
pub struct Registry {
    actions: ActionTable,
    services: ServiceTable,
    qualifiers: QualifierTable,
    events: EventIndex,
    plugins: BTreeSet<PluginId>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins)
            .field("verbs", &self.actions.len())
            .field("services", &self.services.len())
            .field("qualifiers", &self.qualifiers.len())
            .finish()
    }
}

impl Registry {
    /// Start building a registry.
    #[must_use]
    pub fn builder(shadowing: BuiltinShadowing) -> RegistryBuilder {
        RegistryBuilder::new(shadowing)
    }

    /// Action bound to `verb`.
    ///
    /// # Errors
    ///
    /// See [`ActionTable::resolve`].
    pub fn resolve_action(
        &self,
        verb: &str,
        preposition: Option<&str>,
    ) -> Result<Arc<ResolvedAction>, StructuredError> {
        self.actions.resolve(verb, preposition)
    }

    /// Method named by a `service:method` target.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` for a malformed target and
    /// `action-not-found` for an unknown service or method.
    pub fn resolve_service(&self, target: &str) -> Result<&ServiceMethod, StructuredError> {
        self.services.resolve(&ServiceCall::parse(target)?)
    }

    /// Qualifier named `name`.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown name.
    pub fn resolve_qualifier(&self, name: &str) -> Result<&RegisteredQualifier, StructuredError> {
        self.qualifiers.resolve(name)
    }

    /// Handlers subscribed to `event`.
    #[must_use]
    pub fn subscribers(&self, event: &str) -> &[Subscriber] {
        self.events.subscribers(event)
    }

    /// Verb table.
    #[must_use]
    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    /// Service table.
    #[must_use]
    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    /// Qualifier table.
    #[must_use]
    pub fn qualifiers(&self) -> &QualifierTable {
        &self.qualifiers
    }

    /// Event subscriptions.
    #[must_use]
    pub fn events(&self) -> &EventIndex {
        &self.events
    }

    /// Whether `plugin` contributed to this registry.
    #[must_use]
    pub fn contains_plugin(&self, plugin: &PluginId) -> bool {
        self.plugins.contains(plugin)
    }

    /// Snapshot with everything `plugin` registered removed.
    #[must_use]
    pub fn without_plugin(&self, plugin: &PluginId) -> Self {
        let mut next = self.clone();
        next.actions.remove_plugin(plugin);
        next.services.remove_plugin(plugin);
        next.qualifiers.remove_plugin(plugin);
        next.events.remove_plugin(plugin);
        next.plugins.remove(plugin);
        next
    }
}

/// Accumulates registrations during the load phase.
pub struct RegistryBuilder {
    registry: Registry,
    shadowing: BuiltinShadowing,
}

impl RegistryBuilder {
    /// Empty builder applying `shadowing` to plugin/built-in conflicts.
    #[must_use]
    pub fn new(shadowing: BuiltinShadowing) -> Self {
        Self {
            registry: Registry::default(),
            shadowing,
        }
    }

    /// Register a built-in action.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateBuiltin`](crate::error::PluginError::DuplicateBuiltin)
    /// if a verb is already held by another built-in.
    pub fn register_builtin(&mut self, action: Arc<dyn BuiltinAction>) -> PluginResult<()> {
        self.registry.actions.register_builtin(action)
    }

    /// Register everything the loaded `hosts` of `plugin` export. Either
    /// every table takes the plugin or none does.
    ///
    /// # Errors
    ///
    /// Returns a verb or qualifier collision, or malformed metadata when two
    /// providers export the same method.
    pub fn register_plugin(
        &mut self,
        plugin: &PluginId,
        hosts: &[Arc<dyn PluginHost>],
    ) -> PluginResult<()> {
        let mut actions: Vec<(ActionSpec, Arc<dyn PluginHost>)> = Vec::new();
        let mut qualifiers: Vec<(QualifierSpec, Arc<dyn PluginHost>)> = Vec::new();
        for host in hosts {
            let Some(metadata) = host.metadata() else {
                continue;
            };
            actions.extend(metadata.actions.iter().map(|a| (a.clone(), Arc::clone(host))));
            qualifiers.extend(
                metadata
                    .qualifiers
                    .iter()
                    .map(|q| (q.clone(), Arc::clone(host))),
            );
        }

        let mut staged = self.registry.clone();
        staged
            .actions
            .register_plugin(plugin, &actions, self.shadowing)?;
        staged.services.register_plugin(plugin, &actions)?;
        staged.qualifiers.register_plugin(plugin, &qualifiers)?;
        for host in hosts {
            if let Some(metadata) = host.metadata() {
                staged.events.subscribe(plugin, host, &metadata.events);
            }
        }
        staged.plugins.insert(plugin.clone());

        debug!(
            plugin = %plugin,
            actions = actions.len(),
            qualifiers = qualifiers.len(),
            "plugin registered"
        );
        self.registry = staged;
        Ok(())
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::error::PluginError;
    use crate::host::testing::RecordingHost;
    use crate::manifest::{ActionRole, PluginMetadata};

    fn loaded(name: &str, metadata: &Value) -> Arc<dyn PluginHost> {
        let id = PluginId::new(name).unwrap();
        let metadata = PluginMetadata::from_value(&id, metadata.clone()).unwrap();
        Arc::new(RecordingHost::new(name).with_metadata(metadata))
    }

    #[tokio::test]
    async fn test_register_and_resolve_every_kind() {
        let mut builder = Registry::builder(BuiltinShadowing::RoleCompatible);
        builder
            .register_builtin(actions::tests::builtin("log", ActionRole::Outbound))
            .unwrap();

        let csv = loaded(
            "csv",
            &json!({
                "actions": ["parse-csv", { "name": "describe", "verbs": [] }],
                "qualifiers": [{ "name": "columns", "inputTypes": ["List"] }],
                "events": ["FileUploaded"]
            }),
        );
        builder
            .register_plugin(&PluginId::new("csv").unwrap(), &[csv])
            .unwrap();
        let registry = builder.build();

        assert!(registry.resolve_action("log", None).unwrap().plugin().is_none());
        assert_eq!(
            registry.resolve_action("parsecsv", None).unwrap().spec.name,
            "parse-csv"
        );
        assert_eq!(registry.resolve_service("csv:describe").unwrap().action, "describe");
        assert!(registry.resolve_qualifier("columns").is_ok());
        assert_eq!(registry.subscribers("FileUploaded").len(), 1);
        assert!(registry.contains_plugin(&PluginId::new("csv").unwrap()));
    }

    #[test]
    fn test_failed_registration_leaves_no_trace() {
        let mut builder = Registry::builder(BuiltinShadowing::RoleCompatible);
        builder
            .register_plugin(
                &PluginId::new("lists").unwrap(),
                &[loaded("lists", &json!({ "qualifiers": [{ "name": "reverse" }] }))],
            )
            .unwrap();

        // Actions register fine, then the qualifier collides.
        let err = builder
            .register_plugin(
                &PluginId::new("strings").unwrap(),
                &[loaded(
                    "strings",
                    &json!({ "actions": ["upper"], "qualifiers": [{ "name": "reverse" }] }),
                )],
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::QualifierCollision { .. }));

        let registry = builder.build();
        assert!(registry.resolve_action("upper", None).is_err());
        assert!(registry.resolve_service("strings:upper").is_err());
        assert!(!registry.contains_plugin(&PluginId::new("strings").unwrap()));
    }

    #[test]
    fn test_without_plugin_snapshot() {
        let mut builder = Registry::builder(BuiltinShadowing::RoleCompatible);
        let csv_id = PluginId::new("csv").unwrap();
        builder
            .register_plugin(
                &csv_id,
                &[loaded("csv", &json!({ "actions": ["parse-csv"], "events": ["Tick"] }))],
            )
            .unwrap();
        let registry = builder.build();

        let next = registry.without_plugin(&csv_id);
        assert!(next.resolve_action("parsecsv", None).is_err());
        assert!(next.resolve_service("csv:parse-csv").is_err());
        assert!(next.subscribers("Tick").is_empty());
        // The original snapshot is untouched.
        assert!(registry.resolve_action("parsecsv", None).is_ok());
    }
}
