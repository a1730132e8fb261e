//! Plugin identity and lifecycle state.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Maximum length of a plugin name.
const MAX_ID_LEN: usize = 64;

/// Unique plugin name within a load session.
///
/// Names are non-empty, at most 64 characters, and contain only lowercase
/// ASCII alphanumerics, hyphens and underscores. They must not start or end
/// with a hyphen. The name doubles as the service name in
/// `service:method` calls.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginId(String);

impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the name is empty, too long, or
    /// contains invalid characters.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin name must not be empty".into()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(PluginError::InvalidId(format!(
                "plugin name is longer than {MAX_ID_LEN} characters: {id}"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(PluginError::InvalidId(format!(
                "plugin name must contain only lowercase alphanumerics, hyphens and underscores, got: {id}"
            )));
        }
        if id.starts_with('-') || id.ends_with('-') {
            return Err(PluginError::InvalidId(format!(
                "plugin name must not start or end with a hyphen, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a plugin or of one of its hosts.
///
/// `Unloaded → Loading → {Loaded | LoadFailed} → Unloaded`. A
/// `LoadFailed` plugin is not retried within the same session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    /// Not loaded yet, or shut down.
    Unloaded,
    /// Load in progress.
    Loading,
    /// Loaded and serving calls.
    Loaded,
    /// Load failed with the given reason.
    LoadFailed(String),
}

impl PluginState {
    /// Whether calls can be dispatched.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Loading => f.write_str("loading"),
            Self::Loaded => f.write_str("loaded"),
            Self::LoadFailed(reason) => write!(f, "load failed ({reason})"),
        }
    }
}

/// Shared, lock-protected [`PluginState`].
///
/// Hosts are shared behind `Arc` once loaded, so the state they report
/// has to be mutable through `&self`.
#[derive(Debug)]
pub(crate) struct StateCell(RwLock<PluginState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(RwLock::new(PluginState::Unloaded))
    }

    pub(crate) fn get(&self) -> PluginState {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set(&self, state: PluginState) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move to `Loading`, failing if the host is not `Unloaded`.
    pub(crate) fn begin_load(&self, plugin: &PluginId) -> PluginResult<()> {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != PluginState::Unloaded {
            return Err(PluginError::InvalidState {
                plugin: plugin.clone(),
                state: guard.to_string(),
                expected: "unloaded",
            });
        }
        *guard = PluginState::Loading;
        Ok(())
    }

    /// `Loaded → Unloaded`. Any other state is left alone, so a failed
    /// load stays failed.
    pub(crate) fn shut_down(&self) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_loaded() {
            *guard = PluginState::Unloaded;
        }
    }

    /// Record the outcome of a load attempt and pass it through.
    pub(crate) fn finish_load<T>(&self, result: PluginResult<T>) -> PluginResult<T> {
        match &result {
            Ok(_) => self.set(PluginState::Loaded),
            Err(e) => self.set(PluginState::LoadFailed(e.to_string())),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(PluginId::new("plugin-rust-csv").is_ok());
        assert!(PluginId::new("collection_2").is_ok());
        assert!(PluginId::new("a").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(PluginId::new("").is_err());
        assert!(PluginId::new("CSV").is_err());
        assert!(PluginId::new("-csv").is_err());
        assert!(PluginId::new("csv-").is_err());
        assert!(PluginId::new("../etc").is_err());
        assert!(PluginId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: PluginId = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(ok.as_str(), "csv");
        assert!(serde_json::from_str::<PluginId>("\"Bad Name\"").is_err());
    }

    #[test]
    fn test_state_cell_lifecycle() {
        let id = PluginId::new("csv").unwrap();
        let cell = StateCell::new();
        assert_eq!(cell.get(), PluginState::Unloaded);

        cell.begin_load(&id).unwrap();
        assert_eq!(cell.get(), PluginState::Loading);
        assert!(cell.begin_load(&id).is_err());

        let out: PluginResult<()> = Err(PluginError::NotFound("x".into()));
        assert!(cell.finish_load(out).is_err());
        assert!(matches!(cell.get(), PluginState::LoadFailed(_)));

        // LoadFailed is terminal for the session.
        cell.shut_down();
        assert!(matches!(cell.get(), PluginState::LoadFailed(_)));
        assert!(cell.begin_load(&id).is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PluginState::Loaded.to_string(), "loaded");
        assert!(PluginState::Loaded.is_loaded());
        assert!(!PluginState::Loading.is_loaded());
    }
}
