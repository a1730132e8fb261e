//! Per-call context for correlating plugin invocations in logs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context carried through one invocation of a plugin action, service
/// method, qualifier, or system object.
///
/// Nested calls (a plugin calling back into the runtime) use [`child`]
/// so they share the root call's correlation id.
///
/// [`child`]: CallContext::child
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    /// Unique id of this call.
    pub call_id: Uuid,
    /// Id shared by every call descending from the same root call.
    pub correlation_id: Uuid,
    /// Id of the call that spawned this one.
    pub parent_id: Option<Uuid>,
    /// Plugin handling the call, once known.
    pub plugin: Option<String>,
    /// Operation name (`execute`, `object.read`, ...).
    pub operation: String,
    /// Action, method, qualifier or object name the call targets.
    pub target: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CallContext {
    /// Create a root context for `operation`.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            call_id: id,
            correlation_id: id,
            parent_id: None,
            plugin: None,
            operation: operation.into(),
            target: None,
            started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Create a nested context that inherits correlation and metadata.
    #[must_use]
    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            parent_id: Some(self.call_id),
            plugin: None,
            operation: operation.into(),
            target: None,
            started_at: Utc::now(),
            metadata: self.metadata.clone(),
        }
    }

    /// Set the handling plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Set the call target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Add metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Milliseconds since the call started.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// A span carrying this context's identifiers.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "plugin_call",
            call_id = %self.call_id,
            correlation_id = %self.correlation_id,
            operation = %self.operation,
            plugin = self.plugin.as_deref(),
            target = self.target.as_deref(),
        )
    }

    /// First eight hex digits of the call id.
    #[must_use]
    pub fn short_id(&self) -> String {
        let mut id = self.call_id.simple().to_string();
        id.truncate(8);
        id
    }
}

/// Guard that enters a call's span and logs its duration when dropped.
pub struct CallGuard {
    context: CallContext,
    _span: tracing::span::EnteredSpan,
}

impl CallGuard {
    /// Enter `context`'s span.
    #[must_use]
    pub fn new(context: CallContext) -> Self {
        let span = context.span().entered();
        tracing::trace!("call started");
        Self {
            context,
            _span: span,
        }
    }

    /// The guarded context.
    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.context
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        tracing::debug!(elapsed_ms = self.context.elapsed_ms(), "call finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_context() {
        let ctx = CallContext::new("execute");
        assert_eq!(ctx.call_id, ctx.correlation_id);
        assert!(ctx.parent_id.is_none());
        assert_eq!(ctx.operation, "execute");
    }

    #[test]
    fn test_child_inherits_correlation() {
        let parent = CallContext::new("execute")
            .with_plugin("csv")
            .with_metadata("verb", "parse");
        let child = parent.child("object.read");

        assert_ne!(child.call_id, parent.call_id);
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.parent_id, Some(parent.call_id));
        assert!(child.plugin.is_none());
        assert_eq!(child.metadata.get("verb").map(String::as_str), Some("parse"));
    }

    #[test]
    fn test_short_id() {
        let ctx = CallContext::new("execute");
        let short = ctx.short_id();
        assert_eq!(short.len(), 8);
        assert!(ctx.call_id.simple().to_string().starts_with(&short));
    }

    #[test]
    fn test_guard_exposes_context() {
        let guard = CallGuard::new(CallContext::new("qualifier").with_target("upper"));
        assert_eq!(guard.context().target.as_deref(), Some("upper"));
    }
}
