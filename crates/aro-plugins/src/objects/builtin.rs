//! Built-in system objects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Capability, CapabilitySet, EnvSource, ObjectRequest, SystemObject};
use crate::bridge::{ErrorCode, InvocationResult, StructuredError};

/// Compile a list pattern. An empty pattern matches everything.
fn matcher(pattern: &str) -> Result<GlobMatcher, StructuredError> {
    let pattern = if pattern.is_empty() { "*" } else { pattern };
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| StructuredError::invalid_arguments(format!("invalid pattern '{pattern}': {e}")))
}

fn missing_key(object: &str, key: &str) -> StructuredError {
    StructuredError::new(
        ErrorCode::ResourceUnavailable,
        format!("{object} has no entry '{key}'"),
    )
    .with_detail(serde_json::json!({ "object": object, "key": key }))
}

/// `env`: process environment variables, read at call time.
pub struct EnvObject {
    source: Arc<dyn EnvSource>,
}

impl EnvObject {
    /// Object name.
    pub const NAME: &'static str = "env";

    /// Serve variables from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn EnvSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl SystemObject for EnvObject {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty()
            .with(Capability::Readable)
            .with(Capability::Enumerable)
    }

    async fn read(&self, request: &ObjectRequest) -> InvocationResult {
        self.source
            .var(&request.qualifier)
            .map(Value::String)
            .ok_or_else(|| missing_key(Self::NAME, &request.qualifier))
    }

    async fn list(&self, request: &ObjectRequest) -> InvocationResult {
        let matcher = matcher(&request.qualifier)?;
        let mut names: Vec<String> = self
            .source
            .vars()
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| matcher.is_match(k))
            .collect();
        names.sort();
        Ok(Value::from(names))
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// `memory`: an in-process key/value store shared by every handle opened
/// from the same table.
///
/// Writes accept a `ttl_ms` option; expired entries read as missing and are
/// purged on the next write.
#[derive(Debug, Default)]
pub struct MemoryObject {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryObject {
    /// Object name.
    pub const NAME: &'static str = "memory";

    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SystemObject for MemoryObject {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty()
            .with(Capability::Readable)
            .with(Capability::Writable)
            .with(Capability::Enumerable)
    }

    async fn read(&self, request: &ObjectRequest) -> InvocationResult {
        let entries = self.entries.read().await;
        entries
            .get(&request.qualifier)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone())
            .ok_or_else(|| missing_key(Self::NAME, &request.qualifier))
    }

    async fn write(&self, request: &ObjectRequest) -> InvocationResult {
        if request.qualifier.is_empty() {
            return Err(StructuredError::invalid_arguments("memory write needs a key"));
        }
        let ttl = match request.options.get("ttl_ms") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().map(Duration::from_millis).ok_or_else(|| {
                StructuredError::invalid_arguments("ttl_ms must be a non-negative integer")
            })?),
        };
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            request.qualifier.clone(),
            MemoryEntry {
                value: request.payload.clone(),
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        Ok(Value::Null)
    }

    async fn list(&self, request: &ObjectRequest) -> InvocationResult {
        let matcher = matcher(&request.qualifier)?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<&String> = entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && matcher.is_match(k.as_str()))
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        Ok(Value::from(keys.into_iter().cloned().collect::<Vec<_>>()))
    }
}
