use std::collections::HashMap;

use serde_json::Value;

use crate::{EventNaming, EventType, IntegrationEvent, Result};

/// A known event type, as recorded in the [`EventTypeCatalog`].
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    event_type: EventType,
    reparse: fn(&str) -> Result<Value>,
}

impl CatalogEntry {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Parse `payload` strictly as this entry's concrete type.
    ///
    /// The payload is deserialized into the Rust type and serialized back, so
    /// the returned value only contains what the type itself accepts.
    pub fn reparse(&self, payload: &str) -> Result<Value> {
        (self.reparse)(payload)
    }
}

fn reparse_as<E: IntegrationEvent>(payload: &str) -> Result<Value> {
    let event: E = serde_json::from_str(payload)?;
    Ok(serde_json::to_value(event)?)
}

/// Every event type the application knows about, keyed by type name.
///
/// Unlike the [`SubscriptionRegistry`](crate::SubscriptionRegistry), which only
/// holds what this process subscribes to, the catalog covers all event types
/// exchanged on the broker. The recovery flow uses it to replay failures that
/// may have happened in another service.
#[derive(Debug, Clone, Default)]
pub struct EventTypeCatalog {
    entries: HashMap<&'static str, CatalogEntry>,
}

impl EventTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `E`. Registering the same type twice is harmless.
    pub fn register<E: IntegrationEvent>(&mut self) -> &mut Self {
        self.entries.insert(
            E::TYPE_NAME,
            CatalogEntry {
                event_type: EventType::of::<E>(),
                reparse: reparse_as::<E>,
            },
        );
        self
    }

    pub fn with<E: IntegrationEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    pub fn resolve(&self, type_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(type_name)
    }

    /// Look up a type by its event name instead of its type name.
    pub fn resolve_event_name(&self, naming: &EventNaming, event_name: &str) -> Option<&CatalogEntry> {
        self.entries
            .values()
            .find(|entry| naming.event_name(entry.event_type.type_name()) == event_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
