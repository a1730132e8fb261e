//! Load sessions.
//!
//! A [`Session`] is built in one explicit load phase: discover manifests,
//! resolve the dependency order, bring each plugin's providers up and merge
//! what they export into the registry and the system object table. After
//! that the tables are frozen behind `Arc` and every call goes through
//! `&self`.
//!
//! ```ignore
//! let session = SessionBuilder::new(config)
//!     .builtin(Arc::new(LogAction::default()))
//!     .build()
//!     .await?;
//! let rows = session.invoke_action("parsecsv", Some("from"), input).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{Instrument, debug, info, warn};

use aro_config::{Config, LoadFailurePolicy};
use aro_telemetry::CallContext;

use crate::bridge::{InvocationResult, StructuredError};
use crate::discovery::discover_manifests;
use crate::error::{PluginError, PluginResult, ResolutionError};
use crate::host::{HostServices, PluginHost, UnitExecutor, create_host};
use crate::manifest::{PluginDescriptor, current_platform};
use crate::objects::{EnvSource, ObjectHandle, ProcessEnv, SystemObject, SystemObjectTable};
use crate::plugin::{PluginId, PluginState};
use crate::registry::{BuiltinAction, Registry, RegistryBuilder};
use crate::resolver::{resolve, resolve_lenient};

/// A plugin that was dropped during the load phase.
#[derive(Debug)]
pub struct LoadFailure {
    /// Plugin the failure is attributed to, when known.
    pub plugin: Option<PluginId>,
    /// What went wrong.
    pub error: PluginError,
}

impl From<PluginError> for LoadFailure {
    fn from(error: PluginError) -> Self {
        Self {
            plugin: error.plugin().cloned(),
            error,
        }
    }
}

/// A plugin whose providers all loaded.
pub struct LoadedPlugin {
    descriptor: PluginDescriptor,
    hosts: Vec<Arc<dyn PluginHost>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("hosts", &self.hosts)
            .finish()
    }
}

impl LoadedPlugin {
    /// Parsed manifest.
    #[must_use]
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// One host per loaded provider, in declaration order.
    #[must_use]
    pub fn hosts(&self) -> &[Arc<dyn PluginHost>] {
        &self.hosts
    }

    /// `Loaded` while every host is loaded, otherwise the first other
    /// state found.
    #[must_use]
    pub fn state(&self) -> PluginState {
        self.hosts
            .iter()
            .map(|h| h.state())
            .find(|s| !s.is_loaded())
            .unwrap_or(PluginState::Loaded)
    }

    async fn shutdown(&self) {
        for host in self.hosts.iter().rev() {
            host.shutdown().await;
        }
    }
}

/// Result of one event handler.
#[derive(Debug)]
pub struct EventOutcome {
    /// Plugin that handled the event.
    pub plugin: PluginId,
    /// Handler that ran.
    pub handler: String,
    /// What it returned.
    pub result: InvocationResult,
}

/// Configures and runs the load phase.
pub struct SessionBuilder {
    config: Config,
    services: HostServices,
    builtin_actions: Vec<Arc<dyn BuiltinAction>>,
    builtin_objects: Vec<Arc<dyn SystemObject>>,
    descriptors: Vec<PluginDescriptor>,
    discover: bool,
    env: Arc<dyn EnvSource>,
}

impl SessionBuilder {
    /// Builder that discovers plugins in the configured directories.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            services: HostServices::default(),
            builtin_actions: Vec::new(),
            builtin_objects: Vec::new(),
            descriptors: Vec::new(),
            discover: true,
            env: Arc::new(ProcessEnv),
        }
    }

    /// Register a built-in action before any plugin.
    #[must_use]
    pub fn builtin(mut self, action: Arc<dyn BuiltinAction>) -> Self {
        self.builtin_actions.push(action);
        self
    }

    /// Register a built-in system object next to `env` and `memory`.
    #[must_use]
    pub fn system_object(mut self, object: Arc<dyn SystemObject>) -> Self {
        self.builtin_objects.push(object);
        self
    }

    /// Add a plugin that was not found by discovery.
    #[must_use]
    pub fn descriptor(mut self, descriptor: PluginDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Enable or disable directory discovery.
    #[must_use]
    pub fn discover(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }

    /// Executor for declarative units.
    #[must_use]
    pub fn unit_executor(mut self, executor: Arc<dyn UnitExecutor>) -> Self {
        self.services.unit_executor = Some(executor);
        self
    }

    /// Environment used by the `env` object and object config lookups.
    #[must_use]
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    /// Run the load phase.
    ///
    /// Under [`LoadFailurePolicy::Skip`] a failing plugin, and everything
    /// that depends on it, is recorded in [`Session::failures`] and left
    /// out. Under [`LoadFailurePolicy::Abort`] the first failure shuts down
    /// what was already loaded and is returned.
    ///
    /// # Errors
    ///
    /// Returns a duplicate built-in, or under `Abort` the first discovery,
    /// resolution, load or registration error.
    pub async fn build(self) -> PluginResult<Session> {
        let policy = self.config.plugins.load_failure_policy;
        let mut registry = Registry::builder(self.config.plugins.builtin_shadowing);
        for action in self.builtin_actions {
            registry.register_builtin(action)?;
        }
        let mut objects = SystemObjectTable::with_builtins(Arc::clone(&self.env));
        for object in self.builtin_objects {
            objects.register_builtin(object)?;
        }

        let mut failures: Vec<LoadFailure> = Vec::new();
        let mut candidates = self.descriptors;
        if self.discover {
            let found = discover_manifests(
                &self.config.plugins.directories,
                &self.config.plugins.manifest_file,
            );
            let mut discovery_failures = found.failures.into_iter();
            match policy {
                LoadFailurePolicy::Abort => {
                    if let Some(error) = discovery_failures.next() {
                        return Err(error);
                    }
                },
                LoadFailurePolicy::Skip => {
                    failures.extend(discovery_failures.map(LoadFailure::from));
                },
            }
            candidates.extend(found.descriptors);
        }

        let order = match policy {
            LoadFailurePolicy::Abort => resolve(candidates)?,
            LoadFailurePolicy::Skip => {
                let resolution = resolve_lenient(candidates);
                failures.extend(
                    resolution
                        .failures
                        .into_iter()
                        .map(|e| LoadFailure::from(PluginError::from(e))),
                );
                resolution.order
            },
        };

        let mut loader = Loader {
            config: &self.config,
            services: &self.services,
            registry,
            objects,
            plugins: BTreeMap::new(),
            load_order: Vec::new(),
        };
        for descriptor in order {
            let name = descriptor.name.clone();
            if let Err(error) = loader.load(descriptor).await {
                warn!(plugin = %name, error = %error, "plugin failed to load");
                if policy == LoadFailurePolicy::Abort {
                    loader.shutdown_all().await;
                    return Err(error);
                }
                failures.push(LoadFailure {
                    plugin: Some(name),
                    error,
                });
            }
        }

        let Loader {
            registry,
            objects,
            plugins,
            load_order,
            ..
        } = loader;
        info!(
            loaded = load_order.len(),
            failed = failures.len(),
            "plugin load phase finished"
        );
        Ok(Session {
            config: self.config,
            registry: registry.build(),
            objects: Arc::new(objects),
            plugins,
            load_order,
            failures,
            env: self.env,
        })
    }
}

/// Mutable state of the load phase.
struct Loader<'a> {
    config: &'a Config,
    services: &'a HostServices,
    registry: RegistryBuilder,
    objects: SystemObjectTable,
    plugins: BTreeMap<PluginId, LoadedPlugin>,
    load_order: Vec<PluginId>,
}

impl Loader<'_> {
    async fn load(&mut self, descriptor: PluginDescriptor) -> PluginResult<()> {
        if let Some(dependency) = descriptor
            .dependencies
            .iter()
            .find(|d| !self.plugins.contains_key(&d.name))
        {
            return Err(ResolutionError::DependencyFailed {
                plugin: descriptor.name.clone(),
                dependency: dependency.name.clone(),
            }
            .into());
        }

        let hosts = self.start_hosts(&descriptor).await?;
        let plugin = LoadedPlugin { descriptor, hosts };
        if let Err(error) = self.register(&plugin) {
            plugin.shutdown().await;
            return Err(error);
        }

        let name = plugin.descriptor.name.clone();
        info!(
            plugin = %name,
            version = %plugin.descriptor.version,
            providers = plugin.hosts.len(),
            "plugin loaded"
        );
        self.load_order.push(name.clone());
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Create and load a host per provider that runs on this platform.
    async fn start_hosts(
        &self,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<Vec<Arc<dyn PluginHost>>> {
        let platform = current_platform();
        if !descriptor.supports_platform(platform) {
            return Err(PluginError::UnsupportedPlatform {
                plugin: descriptor.name.clone(),
                platforms: descriptor.platforms.clone(),
                current: platform,
            });
        }
        let providers: Vec<_> = descriptor
            .providers
            .iter()
            .filter(|p| {
                let supported = p.supports_platform(platform);
                if !supported {
                    debug!(plugin = %descriptor.name, kind = %p.host_kind(), "skipping provider for other platforms");
                }
                supported
            })
            .collect();
        if providers.is_empty() {
            return Err(PluginError::UnsupportedPlatform {
                plugin: descriptor.name.clone(),
                platforms: descriptor
                    .providers
                    .iter()
                    .flat_map(|p| p.platforms.iter().cloned())
                    .collect(),
                current: platform,
            });
        }

        let mut hosts: Vec<Arc<dyn PluginHost>> = Vec::with_capacity(providers.len());
        for provider in providers {
            let mut host = create_host(descriptor, provider, self.config, self.services);
            if let Err(error) = host.load().await {
                for loaded in hosts.iter().rev() {
                    loaded.shutdown().await;
                }
                return Err(error);
            }
            hosts.push(Arc::from(host));
        }
        Ok(hosts)
    }

    /// Merge into the object table and the registry, both or neither.
    fn register(&mut self, plugin: &LoadedPlugin) -> PluginResult<()> {
        let name = &plugin.descriptor.name;
        let mut objects = self.objects.clone();
        for host in &plugin.hosts {
            if let Some(metadata) = host.metadata() {
                objects.register_plugin(name, host, &metadata.system_objects)?;
            }
        }
        self.registry.register_plugin(name, &plugin.hosts)?;
        self.objects = objects;
        Ok(())
    }

    async fn shutdown_all(&mut self) {
        for name in self.load_order.iter().rev() {
            if let Some(plugin) = self.plugins.get(name) {
                plugin.shutdown().await;
            }
        }
        self.plugins.clear();
        self.load_order.clear();
    }
}

/// Loaded plugins and the frozen tables that route calls to them.
pub struct Session {
    config: Config,
    registry: Arc<Registry>,
    objects: Arc<SystemObjectTable>,
    plugins: BTreeMap<PluginId, LoadedPlugin>,
    load_order: Vec<PluginId>,
    failures: Vec<LoadFailure>,
    env: Arc<dyn EnvSource>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("load_order", &self.load_order)
            .field("failures", &self.failures.len())
            .field("registry", &self.registry)
            .field("objects", &self.objects)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current registry snapshot.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Current system object table.
    #[must_use]
    pub fn objects(&self) -> &Arc<SystemObjectTable> {
        &self.objects
    }

    /// Loaded plugins, dependencies first.
    #[must_use]
    pub fn load_order(&self) -> &[PluginId] {
        &self.load_order
    }

    /// Plugins dropped during the load phase.
    #[must_use]
    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    /// A loaded plugin by name.
    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.iter().find(|(id, _)| id.as_str() == name).map(|(_, p)| p)
    }

    /// Lifecycle state of `name`: loaded plugins report their hosts, failed
    /// ones `LoadFailed`, unknown or unloaded ones `Unloaded`.
    #[must_use]
    pub fn state(&self, name: &str) -> PluginState {
        if let Some(plugin) = self.plugin(name) {
            return plugin.state();
        }
        self.failures
            .iter()
            .find(|f| f.plugin.as_ref().is_some_and(|p| p.as_str() == name))
            .map_or(PluginState::Unloaded, |f| {
                PluginState::LoadFailed(f.error.to_string())
            })
    }

    /// Invoke the action bound to `verb`.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown verb, `invalid-arguments`
    /// for a preposition the action does not take, or the action's error.
    pub async fn invoke_action(
        &self,
        verb: &str,
        preposition: Option<&str>,
        input: Value,
    ) -> InvocationResult {
        let action = self.registry.resolve_action(verb, preposition)?;
        let context = CallContext::new("execute")
            .with_plugin(action.owner())
            .with_target(action.spec.name.clone())
            .with_metadata("verb", verb);
        traced(context, action.invoke(input)).await
    }

    /// Invoke `service:method`.
    ///
    /// # Errors
    ///
    /// Returns `invalid-arguments` for a malformed target,
    /// `action-not-found` for an unknown service or method, or the method's
    /// error.
    pub async fn call_service(&self, target: &str, input: Value) -> InvocationResult {
        let method = self.registry.resolve_service(target)?;
        let context = CallContext::new("execute")
            .with_plugin(method.plugin.to_string())
            .with_target(method.action.clone());
        traced(context, method.host.execute(&method.action, input)).await
    }

    /// Apply qualifier `name` to `value` of type `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown qualifier,
    /// `invalid-arguments` for a type it does not accept, or the plugin's
    /// error.
    pub async fn apply_qualifier(
        &self,
        name: &str,
        value: Value,
        type_name: &str,
    ) -> InvocationResult {
        let qualifier = self.registry.resolve_qualifier(name)?;
        let context = CallContext::new("qualifier")
            .with_plugin(qualifier.plugin.to_string())
            .with_target(qualifier.spec.name.clone());
        traced(context, qualifier.apply(value, type_name)).await
    }

    /// Open a per-invocation handle on system object `name`.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown object.
    pub fn open_object(&self, name: &str) -> Result<ObjectHandle, StructuredError> {
        self.objects.open(name, Arc::clone(&self.env))
    }

    /// Read `qualifier` from system object `object`.
    ///
    /// # Errors
    ///
    /// Returns `permission-denied` when the object is not readable, or the
    /// object's error.
    pub async fn object_read(
        &self,
        object: &str,
        qualifier: &str,
        options: Map<String, Value>,
    ) -> InvocationResult {
        let handle = self.open_object(object)?;
        traced(self.object_context("object.read", object), handle.read(qualifier, options)).await
    }

    /// Write `payload` to `qualifier` of system object `object`.
    ///
    /// # Errors
    ///
    /// Returns `permission-denied` when the object is not writable, or the
    /// object's error.
    pub async fn object_write(
        &self,
        object: &str,
        qualifier: &str,
        payload: Value,
        options: Map<String, Value>,
    ) -> InvocationResult {
        let handle = self.open_object(object)?;
        traced(
            self.object_context("object.write", object),
            handle.write(qualifier, payload, options),
        )
        .await
    }

    /// List entries of system object `object` matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `permission-denied` when the object is not enumerable, or the
    /// object's error.
    pub async fn object_list(
        &self,
        object: &str,
        pattern: &str,
        options: Map<String, Value>,
    ) -> InvocationResult {
        let handle = self.open_object(object)?;
        traced(self.object_context("object.list", object), handle.list(pattern, options)).await
    }

    fn object_context(&self, operation: &str, object: &str) -> CallContext {
        let context = CallContext::new(operation).with_target(object);
        match self.objects.owner(object) {
            Some(plugin) => context.with_plugin(plugin.to_string()),
            None => context,
        }
    }

    /// Run every handler subscribed to `event`, in registration order.
    /// A failing handler does not stop the others.
    pub async fn dispatch_event(&self, event: &str, payload: &Value) -> Vec<EventOutcome> {
        let root = CallContext::new("event").with_target(event);
        let mut outcomes = Vec::new();
        for subscriber in self.registry.subscribers(event) {
            let context = root
                .child("execute")
                .with_plugin(subscriber.plugin.to_string())
                .with_target(subscriber.handler.clone());
            let result = traced(
                context,
                subscriber.host.execute(&subscriber.handler, payload.clone()),
            )
            .await;
            outcomes.push(EventOutcome {
                plugin: subscriber.plugin.clone(),
                handler: subscriber.handler.clone(),
                result,
            });
        }
        debug!(event, handlers = outcomes.len(), "event dispatched");
        outcomes
    }

    /// Shut `name` down and remove everything it registered.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not loaded.
    pub async fn unload_plugin(&mut self, name: &str) -> PluginResult<()> {
        let id = self
            .plugins
            .keys()
            .find(|id| id.as_str() == name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;

        let dependents: Vec<&str> = self
            .plugins
            .values()
            .filter(|p| p.descriptor.dependencies.iter().any(|d| d.name == id))
            .map(|p| p.descriptor.name.as_str())
            .collect();
        if !dependents.is_empty() {
            warn!(plugin = %id, dependents = ?dependents, "unloading a plugin that others depend on");
        }

        self.registry = Arc::new(self.registry.without_plugin(&id));
        self.objects = Arc::new(self.objects.without_plugin(&id));
        self.load_order.retain(|p| *p != id);
        if let Some(plugin) = self.plugins.remove(&id) {
            plugin.shutdown().await;
        }
        info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    /// Unload every plugin, dependents first.
    pub async fn shutdown(&mut self) {
        let order: Vec<PluginId> = self.load_order.iter().rev().cloned().collect();
        for id in order {
            if let Err(e) = self.unload_plugin(id.as_str()).await {
                warn!(plugin = %id, error = %e, "plugin unload failed during shutdown");
            }
        }
    }
}

/// Run `call` inside `context`'s span and log its outcome.
async fn traced<F>(context: CallContext, call: F) -> InvocationResult
where
    F: Future<Output = InvocationResult>,
{
    let span = context.span();
    async move {
        let result = call.await;
        match &result {
            Ok(_) => debug!(elapsed_ms = context.elapsed_ms(), "call succeeded"),
            Err(e) => debug!(
                elapsed_ms = context.elapsed_ms(),
                code = %e.code,
                error = %e.message,
                "call failed"
            ),
        }
        result
    }
    .instrument(span)
    .await
}
