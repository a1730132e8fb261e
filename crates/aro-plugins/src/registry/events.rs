//! Event name → subscribed handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::host::PluginHost;
use crate::manifest::EventSubscription;
use crate::plugin::PluginId;

/// One handler subscribed to an event.
#[derive(Clone)]
pub struct Subscriber {
    /// Owning plugin.
    pub plugin: PluginId,
    /// Unit or action invoked for the event.
    pub handler: String,
    /// Host that runs the handler.
    pub host: Arc<dyn PluginHost>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("plugin", &self.plugin)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Subscriptions indexed by event name. Handlers keep registration order.
#[derive(Clone, Default)]
pub struct EventIndex {
    events: BTreeMap<String, Vec<Subscriber>>,
}

impl EventIndex {
    /// Add the subscriptions one host declares.
    pub fn subscribe(
        &mut self,
        plugin: &PluginId,
        host: &Arc<dyn PluginHost>,
        subscriptions: &[EventSubscription],
    ) {
        for sub in subscriptions {
            self.events
                .entry(sub.event.clone())
                .or_default()
                .push(Subscriber {
                    plugin: plugin.clone(),
                    handler: sub.handler_name().to_owned(),
                    host: Arc::clone(host),
                });
        }
    }

    /// Drop every subscription of `plugin`.
    pub fn remove_plugin(&mut self, plugin: &PluginId) {
        self.events.retain(|_, subs| {
            subs.retain(|s| s.plugin != *plugin);
            !subs.is_empty()
        });
    }

    /// Handlers subscribed to `event`.
    #[must_use]
    pub fn subscribers(&self, event: &str) -> &[Subscriber] {
        self.events.get(event).map_or(&[], Vec::as_slice)
    }

    /// Events with at least one subscriber, sorted.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }
}
