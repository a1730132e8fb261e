//! Artifact hosts.
//!
//! A host owns one provider of one plugin: a compiled library, a worker
//! process or a set of declarative files. Every host presents the same
//! surface so the registry never needs to know which kind it is talking to.
//!
//! `load` runs once, with exclusive access, during the load phase. After
//! that the host is shared behind `Arc<dyn PluginHost>` and every call goes
//! through `&self`.

pub mod declarative;
pub mod native;
pub mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use aro_config::Config;

use crate::bridge::{InvocationResult, StructuredError};
use crate::error::PluginResult;
use crate::manifest::{HostKind, PluginDescriptor, PluginMetadata, ProviderKind, ProviderSpec};
use crate::objects::ObjectRequest;
use crate::plugin::{PluginId, PluginState};

pub use declarative::{DeclarativeFileHost, UnitExecutor};
pub use native::CompiledLibraryHost;
pub use subprocess::SubprocessHost;

/// A loaded (or loadable) plugin provider.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Which kind of provider this host runs.
    fn kind(&self) -> HostKind;

    /// Owning plugin.
    fn plugin(&self) -> &PluginId;

    /// Current lifecycle state.
    fn state(&self) -> PluginState;

    /// Metadata reported during load, reconciled with the manifest.
    fn metadata(&self) -> Option<&PluginMetadata>;

    /// Bring the provider up and query its metadata.
    ///
    /// # Errors
    ///
    /// Returns a load error; the host is then `LoadFailed` for the rest of
    /// the session.
    async fn load(&mut self) -> PluginResult<PluginMetadata>;

    /// Invoke an action or service method.
    async fn execute(&self, action: &str, input: Value) -> InvocationResult;

    /// Apply a qualifier to a value of type `type_name`.
    async fn apply_qualifier(
        &self,
        qualifier: &str,
        _value: Value,
        _type_name: &str,
    ) -> InvocationResult {
        Err(StructuredError::not_implemented(format!(
            "{} host of plugin {} does not provide qualifier {qualifier}",
            self.kind(),
            self.plugin()
        )))
    }

    /// Read from a system object this provider exposes.
    async fn object_read(&self, request: &ObjectRequest) -> InvocationResult {
        Err(objects_unsupported(self, request))
    }

    /// Write to a system object this provider exposes.
    async fn object_write(&self, request: &ObjectRequest) -> InvocationResult {
        Err(objects_unsupported(self, request))
    }

    /// List a system object this provider exposes.
    async fn object_list(&self, request: &ObjectRequest) -> InvocationResult {
        Err(objects_unsupported(self, request))
    }

    /// Release the provider. Idempotent; leaves the host `Unloaded`.
    async fn shutdown(&self);
}

fn objects_unsupported<H: PluginHost + ?Sized>(host: &H, request: &ObjectRequest) -> StructuredError {
    StructuredError::not_implemented(format!(
        "{} host of plugin {} does not serve system object {}",
        host.kind(),
        host.plugin(),
        request.object
    ))
}

impl std::fmt::Debug for dyn PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugin", self.plugin())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Collaborators a host may need beyond its manifest and config.
#[derive(Clone, Default)]
pub struct HostServices {
    /// Runs declarative units. Without one, declarative units load but
    /// answer every call with `not-implemented`.
    pub unit_executor: Option<Arc<dyn UnitExecutor>>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("unit_executor", &self.unit_executor.is_some())
            .finish()
    }
}

/// Create the host for one provider of `descriptor`.
///
/// Nothing is opened or spawned until [`PluginHost::load`].
#[must_use]
pub fn create_host(
    descriptor: &PluginDescriptor,
    provider: &ProviderSpec,
    config: &Config,
    services: &HostServices,
) -> Box<dyn PluginHost> {
    match &provider.kind {
        ProviderKind::CompiledLibrary { path, .. } => Box::new(CompiledLibraryHost::new(
            descriptor.name.clone(),
            descriptor.resolve_path(path),
            provider.clone(),
            config.native.call_timeout(),
        )),
        ProviderKind::Subprocess { .. } => Box::new(SubprocessHost::new(
            descriptor,
            provider.clone(),
            &config.subprocess,
        )),
        ProviderKind::Declarative { path, .. } => Box::new(DeclarativeFileHost::new(
            descriptor.name.clone(),
            descriptor.resolve_path(path),
            provider.clone(),
            services.unit_executor.clone(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory host for registry and object table tests.

    use std::sync::Mutex;

    use super::*;
    use crate::plugin::StateCell;

    /// Records every call and echoes its arguments back.
    pub(crate) struct RecordingHost {
        plugin: PluginId,
        state: StateCell,
        metadata: Option<PluginMetadata>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingHost {
        pub(crate) fn new(plugin: &str) -> Self {
            let state = StateCell::new();
            state.set(PluginState::Loaded);
            Self {
                plugin: PluginId::new(plugin).unwrap(),
                state,
                metadata: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_metadata(mut self, metadata: PluginMetadata) -> Self {
            self.metadata = Some(metadata);
            self
        }

        pub(crate) fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, method: &str, params: Value) -> InvocationResult {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_owned(), params.clone()));
            Ok(params)
        }
    }

    #[async_trait]
    impl PluginHost for RecordingHost {
        fn kind(&self) -> HostKind {
            HostKind::Subprocess
        }

        fn plugin(&self) -> &PluginId {
            &self.plugin
        }

        fn state(&self) -> PluginState {
            self.state.get()
        }

        fn metadata(&self) -> Option<&PluginMetadata> {
            self.metadata.as_ref()
        }

        async fn load(&mut self) -> PluginResult<PluginMetadata> {
            Ok(PluginMetadata::default())
        }

        async fn execute(&self, action: &str, input: Value) -> InvocationResult {
            self.record(
                "execute",
                serde_json::json!({ "action": action, "input": input }),
            )
        }

        async fn apply_qualifier(
            &self,
            qualifier: &str,
            value: Value,
            type_name: &str,
        ) -> InvocationResult {
            self.record(
                "qualifier",
                serde_json::json!({ "qualifier": qualifier, "value": value, "type": type_name }),
            )
        }

        async fn object_read(&self, request: &ObjectRequest) -> InvocationResult {
            self.record("object.read", serde_json::to_value(request).unwrap())
        }

        async fn object_write(&self, request: &ObjectRequest) -> InvocationResult {
            self.record("object.write", serde_json::to_value(request).unwrap())
        }

        async fn object_list(&self, request: &ObjectRequest) -> InvocationResult {
            self.record("object.list", serde_json::to_value(request).unwrap())
        }

        async fn shutdown(&self) {
            self.state.set(PluginState::Unloaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_host_selects_variant_from_provider_tag() {
        let descriptor = PluginDescriptor::from_value(
            serde_json::json!({
                "name": "multi",
                "version": "1.0.0",
                "provides": [
                    { "type": "compiled-library", "path": "lib/libmulti" },
                    { "type": "subprocess", "command": "python3", "args": ["plugin.py"] },
                    { "type": "declarative", "path": "features" }
                ]
            }),
            "/plugins/multi",
        )
        .unwrap();
        let config = Config::default();
        let services = HostServices::default();

        let kinds: Vec<HostKind> = descriptor
            .providers
            .iter()
            .map(|p| create_host(&descriptor, p, &config, &services).kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                HostKind::CompiledLibrary,
                HostKind::Subprocess,
                HostKind::Declarative
            ]
        );

        let host = create_host(&descriptor, &descriptor.providers[0], &config, &services);
        assert_eq!(host.state(), PluginState::Unloaded);
        assert!(host.metadata().is_none());
        assert_eq!(host.plugin().as_str(), "multi");
    }
}
