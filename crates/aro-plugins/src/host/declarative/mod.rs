//! Declarative-file host.
//!
//! Loads `.aro` sources, checks their structure and exposes each feature
//! set as a unit. Units named `<Event> <suffix>` subscribe to `<Event>`;
//! every other unit becomes a method-only action. Running a unit is the
//! job of an injected [`UnitExecutor`].

mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::PluginHost;
use crate::bridge::{InvocationResult, StructuredError};
use crate::error::{PluginError, PluginResult};
use crate::manifest::{
    ActionSpec, EventSubscription, HostKind, PluginMetadata, ProviderKind, ProviderSpec,
    DEFAULT_HANDLER_SUFFIX, normalize_name,
};
use crate::plugin::{PluginId, PluginState, StateCell};

pub use parser::{FeatureSet, parse_source};

/// File extension of declarative sources.
pub const SOURCE_EXTENSION: &str = "aro";

/// Runs a declarative unit on behalf of the runtime.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Execute `unit` of `plugin` with `input`.
    async fn execute_unit(&self, plugin: &PluginId, unit: &FeatureSet, input: Value)
    -> InvocationResult;
}

/// Host for a directory (or single file) of declarative sources.
pub struct DeclarativeFileHost {
    plugin: PluginId,
    path: PathBuf,
    provider: ProviderSpec,
    handler_suffix: String,
    executor: Option<Arc<dyn UnitExecutor>>,
    state: StateCell,
    units: HashMap<String, Arc<FeatureSet>>,
    metadata: Option<PluginMetadata>,
}

impl DeclarativeFileHost {
    /// Host for the sources at `path`.
    #[must_use]
    pub fn new(
        plugin: PluginId,
        path: PathBuf,
        provider: ProviderSpec,
        executor: Option<Arc<dyn UnitExecutor>>,
    ) -> Self {
        let handler_suffix = match &provider.kind {
            ProviderKind::Declarative { handler_suffix, .. } => handler_suffix.clone(),
            _ => DEFAULT_HANDLER_SUFFIX.to_owned(),
        };
        Self {
            plugin,
            path,
            provider,
            handler_suffix,
            executor,
            state: StateCell::new(),
            units: HashMap::new(),
            metadata: None,
        }
    }

    /// Loaded unit by name, compared after normalization.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&FeatureSet> {
        self.units.get(&normalize_name(name)).map(AsRef::as_ref)
    }

    fn read_units(&self) -> PluginResult<Vec<FeatureSet>> {
        let files = source_files(&self.plugin, &self.path)?;
        let mut seen: HashMap<String, (PathBuf, usize)> = HashMap::new();
        let mut units = Vec::new();
        for file in files {
            let text = std::fs::read_to_string(&file)?;
            for unit in parse_source(&file, &text)? {
                let key = normalize_name(&unit.name);
                if let Some((first_file, first_line)) = seen.get(&key) {
                    return Err(PluginError::Declarative {
                        file: unit.file.clone(),
                        line: unit.line,
                        message: format!(
                            "unit '{}' is already defined at {}:{first_line}",
                            unit.name,
                            first_file.display()
                        ),
                    });
                }
                seen.insert(key, (unit.file.clone(), unit.line));
                units.push(unit);
            }
        }
        Ok(units)
    }

    fn describe(&self, units: &[FeatureSet]) -> PluginMetadata {
        let mut metadata = PluginMetadata {
            name: self.plugin.to_string(),
            ..PluginMetadata::default()
        };
        for unit in units {
            match unit.handled_event(&self.handler_suffix) {
                Some(event) => metadata.events.push(EventSubscription {
                    event: event.to_owned(),
                    handler: Some(unit.name.clone()),
                }),
                None => metadata.actions.push(ActionSpec::method_only(&unit.name)),
            }
        }
        metadata
    }

    fn open(&mut self) -> PluginResult<PluginMetadata> {
        let units = self.read_units()?;
        let metadata = self
            .describe(&units)
            .reconcile(&self.plugin, &self.provider)?;
        self.units = units
            .into_iter()
            .map(|unit| (normalize_name(&unit.name), Arc::new(unit)))
            .collect();
        Ok(metadata)
    }
}

/// `.aro` files under `path` in file-name order. A file path is taken as
/// is.
fn source_files(plugin: &PluginId, path: &Path) -> PluginResult<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(PluginError::ArtifactNotFound {
            plugin: plugin.clone(),
            path: path.to_path_buf(),
        });
    }
    let mut files = Vec::new();
    // Symlinks are not followed, so a link back up the tree cannot loop.
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == SOURCE_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[async_trait]
impl PluginHost for DeclarativeFileHost {
    fn kind(&self) -> HostKind {
        HostKind::Declarative
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
        let result = self.open();
        let metadata = self.state.finish_load(result)?;
        info!(
            plugin = %self.plugin,
            units = self.units.len(),
            handlers = metadata.events.len(),
            path = %self.path.display(),
            "declarative sources loaded"
        );
        self.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    async fn execute(&self, action: &str, input: Value) -> InvocationResult {
        let state = self.state.get();
        if !state.is_loaded() {
            return Err(StructuredError::invalid_state(format!(
                "plugin {} is {state}",
                self.plugin
            )));
        }
        let unit = self
            .units
            .get(&normalize_name(action))
            .ok_or_else(|| StructuredError::not_found("unit", action))?;
        let Some(executor) = &self.executor else {
            return Err(StructuredError::not_implemented(format!(
                "no executor is configured for declarative unit {}",
                unit.name
            )));
        };
        debug!(plugin = %self.plugin, unit = %unit.name, "declarative execute");
        executor.execute_unit(&self.plugin, unit, input).await
    }

    async fn shutdown(&self) {
        self.state.shut_down();
    }
}
