use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use crate::{Config, Error, EventNaming, EventType, HandlerId, IntegrationEvent, Result};

#[derive(Debug)]
struct Subscription {
    event_type: EventType,
    handlers: Vec<HandlerId>,
}

/// Process-local map from wire-level event names to concrete event types and
/// the handlers subscribed to them.
///
/// The registry is the single place where broker-agnostic event names meet
/// in-process types: publishers ask it for the name of a type, the consumer
/// loop asks it which type and handlers belong to a name.
///
/// It is built during startup and then mostly read, so share it behind an
/// `Arc`. All methods take `&self`.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    naming: EventNaming,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new(naming: EventNaming) -> Self {
        Self {
            naming,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(EventNaming::from_config(config))
    }

    /// Subscribe `handler` to `event_type`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if the handler consumes a different event type,
    ///   or if another type is already registered under the same event name.
    /// - [`Error::DuplicateRegistration`] if the handler is already subscribed.
    pub fn register(&self, event_type: EventType, handler: HandlerId) -> Result<()> {
        if handler.accepts() != event_type {
            return Err(Error::invalid_type(format!(
                "handler '{}' consumes {} and cannot subscribe to {}",
                handler,
                handler.accepts(),
                event_type
            )));
        }

        let event_name = self.event_name_of(event_type);
        let mut subscriptions = self.write();
        let subscription = subscriptions
            .entry(event_name.clone())
            .or_insert_with(|| Subscription {
                event_type,
                handlers: Vec::new(),
            });

        if subscription.event_type != event_type {
            return Err(Error::invalid_type(format!(
                "event name '{}' is already bound to {}, cannot bind {}",
                event_name, subscription.event_type, event_type
            )));
        }
        if subscription.handlers.contains(&handler) {
            return Err(Error::DuplicateRegistration {
                event_name,
                handler,
            });
        }

        tracing::debug!(event_name = %event_name, handler = %handler, "handler subscribed");
        subscription.handlers.push(handler);
        Ok(())
    }

    pub fn register_for<E: IntegrationEvent>(&self, handler: HandlerId) -> Result<()> {
        self.register(EventType::of::<E>(), handler)
    }

    /// Remove a subscription. Does nothing if it does not exist.
    ///
    /// The event name stays known (and resolvable) after its last handler is
    /// removed, but [`has_subscribers`](Self::has_subscribers) turns false.
    pub fn unregister(&self, event_type: EventType, handler: &HandlerId) {
        let event_name = self.event_name_of(event_type);
        let mut subscriptions = self.write();
        if let Some(subscription) = subscriptions.get_mut(&event_name) {
            if subscription.event_type == event_type {
                subscription.handlers.retain(|h| h != handler);
            }
        }
    }

    pub fn has_subscribers(&self, event_name: &str) -> bool {
        self.read()
            .get(event_name)
            .is_some_and(|s| !s.handlers.is_empty())
    }

    /// Handlers subscribed to `event_name`, in registration order.
    pub fn handlers_for(&self, event_name: &str) -> Result<Vec<HandlerId>> {
        self.read()
            .get(event_name)
            .map(|s| s.handlers.clone())
            .ok_or_else(|| Error::UnknownEvent(event_name.to_string()))
    }

    /// The concrete type deliveries on `event_name` must be decoded into.
    pub fn resolve_type(&self, event_name: &str) -> Result<EventType> {
        self.read()
            .get(event_name)
            .map(|s| s.event_type)
            .ok_or_else(|| Error::UnknownEvent(event_name.to_string()))
    }

    pub fn event_name_of(&self, event_type: EventType) -> String {
        self.naming.event_name(event_type.type_name())
    }

    pub fn event_name<E: IntegrationEvent>(&self) -> String {
        self.event_name_of(EventType::of::<E>())
    }

    /// Event names that currently have at least one handler, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, s)| !s.handlers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn naming(&self) -> &EventNaming {
        &self.naming
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
