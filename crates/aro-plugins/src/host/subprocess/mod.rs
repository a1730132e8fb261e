//! Subprocess host: one long-lived worker process per provider.
//!
//! The worker is spawned during load and must answer the `info` handshake
//! within the handshake timeout, otherwise it is killed and the load fails.
//! After that every call is a JSON-lines request with its own correlation
//! id and call timeout.
//!
//! A worker that exits, or that times out `max_consecutive_timeouts` calls
//! in a row, is discarded. Whether the next call gets a fresh worker is up
//! to the restart policy.

mod protocol;
mod worker;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use aro_config::{RestartPolicy, SubprocessSection};

use super::PluginHost;
use crate::bridge::{
    ErrorCode, InvocationResult, StructuredError, interpret_qualifier_response, warn_if_imprecise,
};
use crate::error::{PluginError, PluginResult};
use crate::manifest::{HostKind, PluginDescriptor, PluginMetadata, ProviderKind, ProviderSpec};
use crate::objects::ObjectRequest;
use crate::plugin::{PluginId, PluginState, StateCell};

pub use protocol::{
    METHOD_EXECUTE, METHOD_INFO, METHOD_OBJECT_LIST, METHOD_OBJECT_READ, METHOD_OBJECT_WRITE,
    METHOD_QUALIFIER, METHOD_SHUTDOWN, Request, Response,
};
use worker::Worker;

/// Timeouts and restart behaviour of one subprocess provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Deadline for the `info` handshake.
    pub handshake_timeout: Duration,
    /// Deadline for each call.
    pub call_timeout: Duration,
    /// Grace period between the shutdown request and a kill.
    pub shutdown_timeout: Duration,
    /// Consecutive timeouts after which the worker is discarded.
    pub max_consecutive_timeouts: u32,
    /// What happens after the worker is discarded.
    pub restart: RestartPolicy,
}

impl WorkerSettings {
    /// Global settings with the provider's overrides applied.
    #[must_use]
    pub fn resolve(section: &SubprocessSection, provider: &ProviderSpec) -> Self {
        let mut settings = Self {
            handshake_timeout: section.handshake_timeout(),
            call_timeout: section.call_timeout(),
            shutdown_timeout: section.shutdown_timeout(),
            max_consecutive_timeouts: section.max_consecutive_timeouts,
            restart: section.restart,
        };
        if let ProviderKind::Subprocess {
            handshake_timeout_ms,
            call_timeout_ms,
            restart,
            ..
        } = &provider.kind
        {
            if let Some(ms) = handshake_timeout_ms {
                settings.handshake_timeout = Duration::from_millis(*ms);
            }
            if let Some(ms) = call_timeout_ms {
                settings.call_timeout = Duration::from_millis(*ms);
            }
            if let Some(restart) = restart {
                settings.restart = *restart;
            }
        }
        settings
    }
}

/// How to start the worker.
#[derive(Debug, Clone)]
struct Launch {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    root: PathBuf,
    working_dir: PathBuf,
}

impl Launch {
    fn from_provider(descriptor: &PluginDescriptor, provider: &ProviderSpec) -> Self {
        let (command, args, env, path) = match &provider.kind {
            ProviderKind::Subprocess {
                command,
                args,
                env,
                path,
                ..
            } => (command.clone(), args.clone(), env.clone(), path.clone()),
            _ => (String::new(), Vec::new(), BTreeMap::new(), None),
        };
        let working_dir = path.map_or_else(|| descriptor.root.clone(), |p| descriptor.resolve_path(&p));
        Self {
            command,
            args,
            env,
            root: descriptor.root.clone(),
            working_dir,
        }
    }

    /// Resolve the program: paths are relative to the plugin root, bare
    /// names are looked up on `PATH`.
    fn program(&self, plugin: &PluginId) -> PluginResult<PathBuf> {
        let candidate = Path::new(&self.command);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            let path = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                self.root.join(candidate)
            };
            if path.is_file() {
                Ok(path)
            } else {
                Err(PluginError::ArtifactNotFound {
                    plugin: plugin.clone(),
                    path,
                })
            }
        } else {
            which::which(&self.command).map_err(|_| PluginError::ArtifactNotFound {
                plugin: plugin.clone(),
                path: PathBuf::from(&self.command),
            })
        }
    }

    fn command(&self, plugin: &PluginId) -> PluginResult<Command> {
        let mut command = Command::new(self.program(plugin)?);
        command.args(&self.args).envs(&self.env);
        if self.working_dir.is_dir() {
            command.current_dir(&self.working_dir);
        }
        Ok(command)
    }
}

/// Host for a provider that runs as a child process.
pub struct SubprocessHost {
    plugin: PluginId,
    provider: ProviderSpec,
    launch: Launch,
    settings: WorkerSettings,
    state: StateCell,
    worker: Mutex<Option<Arc<Worker>>>,
    restarts: AtomicU32,
    metadata: Option<PluginMetadata>,
}

impl SubprocessHost {
    /// Host for a `subprocess` provider of `descriptor`.
    #[must_use]
    pub fn new(descriptor: &PluginDescriptor, provider: ProviderSpec, section: &SubprocessSection) -> Self {
        Self {
            plugin: descriptor.name.clone(),
            launch: Launch::from_provider(descriptor, &provider),
            settings: WorkerSettings::resolve(section, &provider),
            provider,
            state: StateCell::new(),
            worker: Mutex::new(None),
            restarts: AtomicU32::new(0),
            metadata: None,
        }
    }

    /// Effective settings.
    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Workers started after the first.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Spawn a worker and run the handshake. The worker is killed on any
    /// failure.
    async fn start(&self) -> PluginResult<(Arc<Worker>, PluginMetadata)> {
        let command = self.launch.command(&self.plugin)?;
        let worker = Worker::spawn(
            self.plugin.clone(),
            command,
            self.settings.max_consecutive_timeouts,
        )
        .map_err(|e| PluginError::HandshakeFailed {
            plugin: self.plugin.clone(),
            message: format!("failed to spawn {}: {e}", self.launch.command),
        })?;

        let info = match worker
            .call(METHOD_INFO, Value::Null, self.settings.handshake_timeout)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                worker.kill().await;
                return Err(if e.code == ErrorCode::Timeout {
                    PluginError::HandshakeTimeout {
                        plugin: self.plugin.clone(),
                        timeout: self.settings.handshake_timeout,
                    }
                } else {
                    PluginError::HandshakeFailed {
                        plugin: self.plugin.clone(),
                        message: e.message,
                    }
                });
            },
        };

        match PluginMetadata::from_value(&self.plugin, info)
            .and_then(|m| m.reconcile(&self.plugin, &self.provider))
        {
            Ok(metadata) => Ok((Arc::new(worker), metadata)),
            Err(e) => {
                worker.kill().await;
                Err(e)
            },
        }
    }

    /// The current worker, replacing a dead or unhealthy one when the
    /// restart policy allows.
    async fn worker(&self) -> Result<Arc<Worker>, StructuredError> {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_ref()
            && worker.is_healthy()
        {
            return Ok(Arc::clone(worker));
        }

        let state = self.state.get();
        if !state.is_loaded() {
            return Err(StructuredError::invalid_state(format!(
                "plugin {} is {state}",
                self.plugin
            )));
        }

        if let Some(old) = slot.take() {
            old.kill().await;
        }
        let restarts = self.restarts.load(Ordering::SeqCst);
        if !self.settings.restart.allows(restarts) {
            return Err(StructuredError::host_terminated(self.plugin.as_str()));
        }
        self.restarts.store(restarts.saturating_add(1), Ordering::SeqCst);

        info!(plugin = %self.plugin, attempt = restarts.saturating_add(1), "restarting worker");
        match self.start().await {
            Ok((worker, _)) => {
                *slot = Some(Arc::clone(&worker));
                Ok(worker)
            },
            Err(e) => {
                warn!(plugin = %self.plugin, error = %e, "worker restart failed");
                Err(StructuredError::host_terminated(self.plugin.as_str())
                    .with_detail(json!({ "plugin": self.plugin.as_str(), "restart_error": e.to_string() })))
            },
        }
    }

    async fn call(&self, method: &str, params: Value) -> InvocationResult {
        let worker = self.worker().await?;
        let result = worker
            .call(method, params, self.settings.call_timeout)
            .await;
        if worker.is_alive() && !worker.is_healthy() {
            warn!(
                plugin = %self.plugin,
                limit = self.settings.max_consecutive_timeouts,
                "worker unhealthy after consecutive timeouts, discarding"
            );
            worker.kill().await;
        }
        result
    }

    async fn object_call(&self, method: &str, request: &ObjectRequest) -> InvocationResult {
        let params = serde_json::to_value(request)
            .map_err(|e| StructuredError::internal(format!("failed to encode object request: {e}")))?;
        self.call(method, params).await
    }
}

#[async_trait]
impl PluginHost for SubprocessHost {
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
        self.state.begin_load(&self.plugin)?;
        let result = self.start().await;
        let (worker, metadata) = self.state.finish_load(result)?;
        *self.worker.get_mut() = Some(worker);
        info!(
            plugin = %self.plugin,
            command = %self.launch.command,
            actions = metadata.actions.len(),
            "worker process loaded"
        );
        self.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    async fn execute(&self, action: &str, input: Value) -> InvocationResult {
        warn_if_imprecise(action, &input);
        self.call(METHOD_EXECUTE, json!({ "action": action, "input": input }))
            .await
    }

    async fn apply_qualifier(
        &self,
        qualifier: &str,
        value: Value,
        type_name: &str,
    ) -> InvocationResult {
        let result = self
            .call(
                METHOD_QUALIFIER,
                json!({ "qualifier": qualifier, "value": value, "type": type_name }),
            )
            .await?;
        interpret_qualifier_response(result)
    }

    async fn object_read(&self, request: &ObjectRequest) -> InvocationResult {
        self.object_call(METHOD_OBJECT_READ, request).await
    }

    async fn object_write(&self, request: &ObjectRequest) -> InvocationResult {
        self.object_call(METHOD_OBJECT_WRITE, request).await
    }

    async fn object_list(&self, request: &ObjectRequest) -> InvocationResult {
        self.object_call(METHOD_OBJECT_LIST, request).await
    }

    async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.terminate(self.settings.shutdown_timeout).await;
            info!(plugin = %self.plugin, "worker process shut down");
        }
        self.state.shut_down();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const INFO_THEN: &str = r#"read line; echo '{"id":1,"result":{"name":"sh","actions":["echo"]}}'; "#;

    fn host(script: &str, extra: Value) -> SubprocessHost {
        let mut provider = json!({ "type": "subprocess", "command": "sh", "args": ["-c", script] });
        if let (Some(p), Some(extra)) = (provider.as_object_mut(), extra.as_object()) {
            p.extend(extra.clone());
        }
        let descriptor = PluginDescriptor::from_value(
            json!({ "name": "sh-plugin", "version": "1.0.0", "provides": [provider] }),
            std::env::temp_dir(),
        )
        .unwrap();
        let provider = descriptor.providers[0].clone();
        SubprocessHost::new(&descriptor, provider, &SubprocessSection::default())
    }

    #[test]
    fn test_settings_overrides() {
        let host = host(
            "true",
            json!({ "call_timeout_ms": 250, "restart": { "policy": "always" } }),
        );
        let defaults = SubprocessSection::default();
        assert_eq!(host.settings().call_timeout, Duration::from_millis(250));
        assert_eq!(host.settings().handshake_timeout, defaults.handshake_timeout());
        assert_eq!(host.settings().restart, RestartPolicy::Always);
    }

    #[tokio::test]
    async fn test_silent_worker_fails_handshake() {
        let mut host = host("cat > /dev/null", json!({ "handshake_timeout_ms": 100 }));
        let err = host.load().await.unwrap_err();
        assert!(matches!(err, PluginError::HandshakeTimeout { .. }));
        assert!(matches!(host.state(), PluginState::LoadFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_error_reported() {
        let mut host = host(
            r#"read line; echo '{"id":1,"error":"no metadata today"}'"#,
            json!({}),
        );
        let err = host.load().await.unwrap_err();
        assert!(
            matches!(err, PluginError::HandshakeFailed { ref message, .. } if message == "no metadata today")
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_artifact_not_found() {
        let descriptor = PluginDescriptor::from_value(
            json!({
                "name": "ghost",
                "version": "1.0.0",
                "provides": [{ "type": "subprocess", "command": "definitely-not-a-real-binary-aro" }]
            }),
            std::env::temp_dir(),
        )
        .unwrap();
        let mut host = SubprocessHost::new(
            &descriptor,
            descriptor.providers[0].clone(),
            &SubprocessSection::default(),
        );
        assert!(matches!(
            host.load().await.unwrap_err(),
            PluginError::ArtifactNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_call_timeout_keeps_worker() {
        let mut host = host(
            &format!("{INFO_THEN}cat > /dev/null"),
            json!({ "call_timeout_ms": 100 }),
        );
        host.load().await.unwrap();
        let err = host.execute("echo", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(host.state().is_loaded());
        assert_eq!(host.restarts(), 0);
        host.shutdown().await;
        assert_eq!(host.state(), PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_crash_without_restart() {
        let mut host = host(&format!("{INFO_THEN}read line; exit 1"), json!({}));
        host.load().await.unwrap();

        let err = host.execute("echo", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTerminated);
        let err = host.execute("echo", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTerminated);
        assert_eq!(host.restarts(), 0);
    }

    #[tokio::test]
    async fn test_crash_with_bounded_restarts() {
        let mut host = host(
            &format!("{INFO_THEN}read line; exit 1"),
            json!({ "restart": { "policy": "on_failure", "max_retries": 1 } }),
        );
        host.load().await.unwrap();

        assert_eq!(
            host.execute("echo", json!({})).await.unwrap_err().code,
            ErrorCode::HostTerminated
        );
        // Second call restarts the worker, which crashes again.
        assert_eq!(
            host.execute("echo", json!({})).await.unwrap_err().code,
            ErrorCode::HostTerminated
        );
        assert_eq!(host.restarts(), 1);
        // Retries exhausted.
        assert_eq!(
            host.execute("echo", json!({})).await.unwrap_err().code,
            ErrorCode::HostTerminated
        );
        assert_eq!(host.restarts(), 1);
    }
}
