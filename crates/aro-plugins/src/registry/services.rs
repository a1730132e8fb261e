//! `service:method` calls.
//!
//! Every plugin is a service named after itself; its methods are all the
//! actions it exports, verb or not. Both halves are matched after
//! [`normalize_name`], so `csv:parse-csv`, `csv:parse_csv` and
//! `CSV:ParseCsv` reach the same method.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bridge::StructuredError;
use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::manifest::{ActionSpec, normalize_name};
use crate::plugin::PluginId;

/// A parsed `service:method` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    /// Service (plugin) name as written.
    pub service: String,
    /// Method name as written.
    pub method: String,
}

impl ServiceCall {
    /// Split `target` at the first `:`.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` when the colon is missing or either half
    /// is empty.
    pub fn parse(target: &str) -> Result<Self, StructuredError> {
        let (service, method) = target
            .split_once(':')
            .map(|(s, m)| (s.trim(), m.trim()))
            .filter(|(s, m)| !s.is_empty() && !m.is_empty())
            .ok_or_else(|| {
                StructuredError::invalid_arguments(format!(
                    "service call '{target}' must have the form service:method"
                ))
            })?;
        Ok(Self {
            service: service.to_owned(),
            method: method.to_owned(),
        })
    }
}

impl std::fmt::Display for ServiceCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.method)
    }
}

/// A method bound to the host that serves it.
#[derive(Clone)]
pub struct ServiceMethod {
    /// Owning plugin.
    pub plugin: PluginId,
    /// Action name passed to the host.
    pub action: String,
    /// Host serving the method.
    pub host: Arc<dyn PluginHost>,
}

impl std::fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("plugin", &self.plugin)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Service {
    plugin: PluginId,
    methods: BTreeMap<String, ServiceMethod>,
}

/// Services registered in a session, keyed by normalized plugin name.
#[derive(Clone, Default)]
pub struct ServiceTable {
    services: BTreeMap<String, Service>,
}

impl ServiceTable {
    /// Register `plugin` as a service exposing `actions`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedMetadata`] if two providers of the
    /// plugin export the same method, and [`PluginError::InvalidState`] if
    /// the plugin is already registered.
    pub fn register_plugin(
        &mut self,
        plugin: &PluginId,
        actions: &[(ActionSpec, Arc<dyn PluginHost>)],
    ) -> PluginResult<()> {
        let key = normalize_name(plugin.as_str());
        if self.services.contains_key(&key) {
            return Err(PluginError::InvalidState {
                plugin: plugin.clone(),
                state: "registered".into(),
                expected: "unregistered",
            });
        }
        let mut service = Service {
            plugin: plugin.clone(),
            methods: BTreeMap::new(),
        };
        for (spec, host) in actions {
            let method = ServiceMethod {
                plugin: plugin.clone(),
                action: spec.name.clone(),
                host: Arc::clone(host),
            };
            if service
                .methods
                .insert(normalize_name(&spec.name), method)
                .is_some()
            {
                return Err(PluginError::MalformedMetadata {
                    plugin: plugin.clone(),
                    message: format!("method '{}' is exported by two providers", spec.name),
                });
            }
        }
        self.services.insert(key, service);
        Ok(())
    }

    /// Drop the service of `plugin`.
    pub fn remove_plugin(&mut self, plugin: &PluginId) {
        self.services.retain(|_, s| s.plugin != *plugin);
    }

    /// Find the method `call` names.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown service or method.
    pub fn resolve(&self, call: &ServiceCall) -> Result<&ServiceMethod, StructuredError> {
        let service = self
            .services
            .get(&normalize_name(&call.service))
            .ok_or_else(|| StructuredError::not_found("service", &call.service))?;
        service
            .methods
            .get(&normalize_name(&call.method))
            .ok_or_else(|| StructuredError::not_found("method", &call.to_string()))
    }

    /// Methods of `service`, by action name.
    #[must_use]
    pub fn methods(&self, service: &str) -> Vec<&str> {
        self.services
            .get(&normalize_name(service))
            .map(|s| s.methods.values().map(|m| m.action.as_str()).collect())
            .unwrap_or_default()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bridge::ErrorCode;
    use crate::host::testing::RecordingHost;

    fn csv_table() -> (ServiceTable, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::new("csv"));
        let dyn_host: Arc<dyn PluginHost> = host.clone();
        let mut table = ServiceTable::default();
        table
            .register_plugin(
                &PluginId::new("csv").unwrap(),
                &[
                    (ActionSpec::from_name("parse-csv"), Arc::clone(&dyn_host)),
                    (ActionSpec::method_only("describe"), dyn_host),
                ],
            )
            .unwrap();
        (table, host)
    }

    #[test]
    fn test_parse_service_call() {
        let call = ServiceCall::parse("csv:parse-csv").unwrap();
        assert_eq!(call.service, "csv");
        assert_eq!(call.method, "parse-csv");
        assert_eq!(call.to_string(), "csv:parse-csv");

        let ns = ServiceCall::parse("redis:get:key").unwrap();
        assert_eq!(ns.method, "get:key");

        for bad in ["csv", ":parse", "csv:", ""] {
            let err = ServiceCall::parse(bad).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArguments, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_method_lookup_ignores_case_and_hyphens() {
        let (table, host) = csv_table();
        for target in ["csv:parse-csv", "csv:parsecsv", "CSV:Parse_CSV"] {
            let method = table.resolve(&ServiceCall::parse(target).unwrap()).unwrap();
            assert_eq!(method.action, "parse-csv");
            method.host.execute(&method.action, json!({})).await.unwrap();
        }
        assert_eq!(host.calls().len(), 3);

        let method = table.resolve(&ServiceCall::parse("csv:describe").unwrap()).unwrap();
        assert_eq!(method.action, "describe");
        assert_eq!(table.methods("csv"), vec!["describe", "parse-csv"]);
    }

    #[test]
    fn test_unknown_service_or_method() {
        let (table, _) = csv_table();
        let err = table.resolve(&ServiceCall::parse("tsv:parse").unwrap()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ActionNotFound);
        assert!(err.message.contains("service"));
        let err = table.resolve(&ServiceCall::parse("csv:render").unwrap()).unwrap_err();
        assert!(err.message.contains("csv:render"));
    }

    #[test]
    fn test_duplicate_method_across_providers() {
        let host: Arc<dyn PluginHost> = Arc::new(RecordingHost::new("csv"));
        let mut table = ServiceTable::default();
        let err = table
            .register_plugin(
                &PluginId::new("csv").unwrap(),
                &[
                    (ActionSpec::from_name("parse-csv"), Arc::clone(&host)),
                    (ActionSpec::from_name("ParseCsv"), host),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::MalformedMetadata { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_plugin() {
        let (mut table, _) = csv_table();
        assert_eq!(table.len(), 1);
        table.remove_plugin(&PluginId::new("csv").unwrap());
        assert!(table.is_empty());
    }
}
