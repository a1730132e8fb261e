//! Plugin-provided value qualifiers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::{InvocationResult, StructuredError};
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::manifest::QualifierSpec;
use crate::plugin::PluginId;

/// A qualifier bound to the host that applies it.
#[derive(Clone)]
pub struct RegisteredQualifier {
    /// Declaration.
    pub spec: QualifierSpec,
    /// Owning plugin.
    pub plugin: PluginId,
    host: Arc<dyn PluginHost>,
}

impl std::fmt::Debug for RegisteredQualifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredQualifier")
            .field("name", &self.spec.name)
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl RegisteredQualifier {
    /// Apply the qualifier to `value` of type `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` if the qualifier does not accept
    /// `type_name`, otherwise whatever the host returns.
    pub async fn apply(&self, value: Value, type_name: &str) -> InvocationResult {
        if !self.spec.accepts(type_name) {
            return Err(StructuredError::invalid_arguments(format!(
                "qualifier {} does not accept {type_name} (accepts: {})",
                self.spec.name,
                self.spec.input_types.join(", ")
            )));
        }
        self.host
            .apply_qualifier(&self.spec.name, value, type_name)
            .await
    }
}

/// Qualifiers registered in a session, keyed by lowercased name.
#[derive(Clone, Default)]
pub struct QualifierTable {
    qualifiers: BTreeMap<String, RegisteredQualifier>,
}

impl QualifierTable {
    /// Register the qualifiers of one plugin, all or none.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::QualifierCollision`] if a name is taken.
    pub fn register_plugin(
        &mut self,
        plugin: &PluginId,
        qualifiers: &[(QualifierSpec, Arc<dyn PluginHost>)],
    ) -> PluginResult<()> {
        let mut staged: BTreeMap<String, RegisteredQualifier> = BTreeMap::new();
        for (spec, host) in qualifiers {
            let key = spec.name.to_lowercase();
            if let Some(first) = self.qualifiers.get(&key).or_else(|| staged.get(&key)) {
                return Err(PluginError::QualifierCollision {
                    name: spec.name.clone(),
                    first: first.plugin.to_string(),
                    second: plugin.clone(),
                });
            }
            staged.insert(
                key,
                RegisteredQualifier {
                    spec: spec.clone(),
                    plugin: plugin.clone(),
                    host: Arc::clone(host),
                },
            );
        }
        self.qualifiers.extend(staged);
        Ok(())
    }

    /// Drop the qualifiers of `plugin`.
    pub fn remove_plugin(&mut self, plugin: &PluginId) {
        self.qualifiers.retain(|_, q| q.plugin != *plugin);
    }

    /// Find a qualifier by name, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown name.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredQualifier, StructuredError> {
        self.qualifiers
            .get(&name.to_lowercase())
            .ok_or_else(|| StructuredError::not_found("qualifier", name))
    }

    /// Registered qualifier names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.qualifiers.values().map(|q| q.spec.name.as_str())
    }

    /// Number of registered qualifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.qualifiers.len()
    }

    /// Whether no qualifier is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.qualifiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bridge::ErrorCode;
    use crate::host::testing::RecordingHost;

    fn spec(name: &str, types: &[&str]) -> QualifierSpec {
        QualifierSpec {
            name: name.into(),
            input_types: types.iter().map(ToString::to_string).collect(),
            description: None,
        }
    }

    fn host(name: &str) -> Arc<dyn PluginHost> {
        Arc::new(RecordingHost::new(name))
    }

    #[tokio::test]
    async fn test_apply_checks_input_type() {
        let mut table = QualifierTable::default();
        table
            .register_plugin(
                &PluginId::new("lists").unwrap(),
                &[(spec("reverse", &["List"]), host("lists"))],
            )
            .unwrap();

        let reverse = table.resolve("Reverse").unwrap();
        let out = reverse.apply(json!([1, 2]), "list").await.unwrap();
        assert_eq!(out["qualifier"], "reverse");
        assert_eq!(out["type"], "list");

        let err = reverse.apply(json!("ab"), "String").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(
            table.resolve("shuffle").unwrap_err().code,
            ErrorCode::ActionNotFound
        );
    }

    #[test]
    fn test_collision_names_both_plugins() {
        let mut table = QualifierTable::default();
        table
            .register_plugin(
                &PluginId::new("lists").unwrap(),
                &[(spec("reverse", &[]), host("lists"))],
            )
            .unwrap();
        let err = table
            .register_plugin(
                &PluginId::new("strings").unwrap(),
                &[
                    (spec("upper", &[]), host("strings")),
                    (spec("REVERSE", &[]), host("strings")),
                ],
            )
            .unwrap_err();
        match err {
            PluginError::QualifierCollision { name, first, second } => {
                assert_eq!(name, "REVERSE");
                assert_eq!(first, "lists");
                assert_eq!(second.as_str(), "strings");
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(table.resolve("upper").is_err());

        table.remove_plugin(&PluginId::new("lists").unwrap());
        assert!(table.is_empty());
    }
}
