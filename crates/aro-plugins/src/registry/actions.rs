//! Verb → action table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use aro_config::BuiltinShadowing;

use crate::bridge::{InvocationResult, StructuredError};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::manifest::ActionSpec;
use crate::plugin::PluginId;

/// An action implemented by the embedding runtime rather than a plugin.
#[async_trait]
pub trait BuiltinAction: Send + Sync {
    /// Name, role, verbs and prepositions of the action.
    fn spec(&self) -> &ActionSpec;

    /// Run the action.
    async fn execute(&self, input: Value) -> InvocationResult;
}

/// Who runs a resolved action.
#[derive(Clone)]
pub enum ActionTarget {
    /// A built-in action.
    Builtin(Arc<dyn BuiltinAction>),
    /// An action exported by a plugin provider.
    Plugin {
        /// Owning plugin.
        plugin: PluginId,
        /// Provider host that exports the action.
        host: Arc<dyn PluginHost>,
    },
}

/// A verb bound to the action that handles it.
#[derive(Clone)]
pub struct ResolvedAction {
    /// Lowercased verb.
    pub verb: String,
    /// Declaration of the action.
    pub spec: ActionSpec,
    /// Implementation.
    pub target: ActionTarget,
}

impl std::fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAction")
            .field("verb", &self.verb)
            .field("action", &self.spec.name)
            .field("owner", &self.owner())
            .finish()
    }
}

impl ResolvedAction {
    /// Owning plugin; `None` for built-ins.
    #[must_use]
    pub fn plugin(&self) -> Option<&PluginId> {
        match &self.target {
            ActionTarget::Builtin(_) => None,
            ActionTarget::Plugin { plugin, .. } => Some(plugin),
        }
    }

    /// Owner name for logs and errors (`builtin` for built-ins).
    #[must_use]
    pub fn owner(&self) -> String {
        self.plugin()
            .map_or_else(|| "builtin".to_owned(), ToString::to_string)
    }

    /// Run the action.
    pub async fn invoke(&self, input: Value) -> InvocationResult {
        match &self.target {
            ActionTarget::Builtin(action) => action.execute(input).await,
            ActionTarget::Plugin { host, .. } => host.execute(&self.spec.name, input).await,
        }
    }
}

#[derive(Clone, Default)]
struct VerbSlot {
    builtin: Option<Arc<ResolvedAction>>,
    plugin: Option<Arc<ResolvedAction>>,
    // Plugin that claimed the verb, kept even when a built-in declined the
    // claim so a later plugin cannot take the verb unnoticed.
    claimant: Option<PluginId>,
}

impl VerbSlot {
    fn active(&self) -> Option<&Arc<ResolvedAction>> {
        self.plugin.as_ref().or(self.builtin.as_ref())
    }
}

/// Verbs registered in a session.
#[derive(Clone, Default)]
pub struct ActionTable {
    verbs: BTreeMap<String, VerbSlot>,
}

impl ActionTable {
    /// Register a built-in action under each of its verbs.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateBuiltin`] if another built-in already
    /// claims one of the verbs.
    pub fn register_builtin(&mut self, action: Arc<dyn BuiltinAction>) -> PluginResult<()> {
        let spec = action.spec().clone().normalized();
        if let Some(verb) = spec
            .verbs
            .iter()
            .find(|v| self.verbs.get(*v).is_some_and(|slot| slot.builtin.is_some()))
        {
            return Err(PluginError::DuplicateBuiltin(verb.clone()));
        }
        for verb in &spec.verbs {
            let resolved = Arc::new(ResolvedAction {
                verb: verb.clone(),
                spec: spec.clone(),
                target: ActionTarget::Builtin(Arc::clone(&action)),
            });
            self.verbs.entry(verb.clone()).or_default().builtin = Some(resolved);
        }
        Ok(())
    }

    /// Register the verbs of `actions`, all or none.
    ///
    /// A verb held by a built-in goes to the plugin only when `shadowing`
    /// allows it; otherwise the built-in keeps it and the plugin action
    /// stays reachable as a service method.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::VerbCollision`] if another plugin, or another
    /// action of the same plugin, already claims one of the verbs.
    pub fn register_plugin(
        &mut self,
        plugin: &PluginId,
        actions: &[(ActionSpec, Arc<dyn PluginHost>)],
        shadowing: BuiltinShadowing,
    ) -> PluginResult<()> {
        let mut claimed: BTreeMap<&str, &PluginId> = BTreeMap::new();
        for (spec, _) in actions {
            for verb in &spec.verbs {
                let existing = self
                    .verbs
                    .get(verb)
                    .and_then(|slot| slot.claimant.as_ref())
                    .or_else(|| claimed.get(verb.as_str()).copied());
                if let Some(first) = existing {
                    return Err(PluginError::VerbCollision {
                        verb: verb.clone(),
                        first: first.clone(),
                        second: plugin.clone(),
                    });
                }
                claimed.insert(verb.as_str(), plugin);
            }
        }

        for (spec, host) in actions {
            for verb in &spec.verbs {
                let slot = self.verbs.entry(verb.clone()).or_default();
                slot.claimant = Some(plugin.clone());
                if let Some(builtin) = &slot.builtin {
                    let compatible = shadowing == BuiltinShadowing::RoleCompatible
                        && builtin.spec.role == spec.role;
                    if !compatible {
                        warn!(
                            plugin = %plugin,
                            verb = %verb,
                            action = %spec.name,
                            builtin_role = ?builtin.spec.role,
                            plugin_role = ?spec.role,
                            "built-in keeps verb; plugin action reachable as service method only"
                        );
                        continue;
                    }
                    info!(plugin = %plugin, verb = %verb, "plugin action shadows built-in verb");
                }
                slot.plugin = Some(Arc::new(ResolvedAction {
                    verb: verb.clone(),
                    spec: spec.clone(),
                    target: ActionTarget::Plugin {
                        plugin: plugin.clone(),
                        host: Arc::clone(host),
                    },
                }));
            }
        }
        Ok(())
    }

    /// Remove every verb `plugin` holds or claimed. Shadowed built-ins come
    /// back.
    pub fn remove_plugin(&mut self, plugin: &PluginId) {
        self.verbs.retain(|_, slot| {
            if slot.claimant.as_ref() == Some(plugin) {
                slot.claimant = None;
            }
            if slot
                .plugin
                .as_ref()
                .is_some_and(|r| r.plugin() == Some(plugin))
            {
                slot.plugin = None;
            }
            slot.active().is_some()
        });
    }

    /// Find the action for `verb`, checking `preposition` when given.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown verb and
    /// `invalid-arguments` for a preposition the action does not accept.
    pub fn resolve(
        &self,
        verb: &str,
        preposition: Option<&str>,
    ) -> Result<Arc<ResolvedAction>, StructuredError> {
        let key = verb.trim().to_lowercase();
        let resolved = self
            .verbs
            .get(&key)
            .and_then(VerbSlot::active)
            .ok_or_else(|| StructuredError::not_found("action", verb))?;
        if let Some(preposition) = preposition
            && !resolved.spec.allows_preposition(preposition)
        {
            return Err(StructuredError::invalid_arguments(format!(
                "verb '{key}' does not accept preposition '{preposition}' (allowed: {})",
                resolved.spec.prepositions.join(", ")
            ))
            .with_detail(serde_json::json!({
                "verb": key,
                "preposition": preposition,
                "allowed": resolved.spec.prepositions,
            })));
        }
        Ok(Arc::clone(resolved))
    }

    /// Registered verbs, sorted.
    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.verbs.keys().map(String::as_str)
    }

    /// Number of registered verbs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    /// Whether no verb is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}
