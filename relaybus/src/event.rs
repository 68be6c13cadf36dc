use std::{any::TypeId, fmt, hash::Hash};

use serde::{Serialize, de::DeserializeOwned};

/// Marker trait for payloads exchanged between services through the bus.
///
/// Events are plain data: they cross process boundaries as JSON, so they must be
/// serde-serializable, and they are handed to concurrently running handlers, so
/// they must be `Send + Sync + Clone + 'static`.
///
/// `TYPE_NAME` identifies the event on the wire. The event name used for routing
/// is derived from it by [`EventNaming`](crate::EventNaming), e.g.
/// `"OrderStartedEto"` is routed as `"OrderStarted"`.
///
/// With the `macros` feature, `#[derive(IntegrationEvent)]` sets `TYPE_NAME`
/// to the identifier of the type:
///
/// ```rust
/// use relaybus::IntegrationEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize, IntegrationEvent)]
/// struct OrderStartedEto {
///     order_id: u64,
/// }
///
/// assert_eq!(OrderStartedEto::TYPE_NAME, "OrderStartedEto");
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Runtime descriptor of a concrete [`IntegrationEvent`] type.
///
/// The registry and the consumer loop use it in place of reflection: it is
/// cheap to copy and compares by the underlying Rust type.
#[derive(Clone, Copy)]
pub struct EventType {
    type_id: TypeId,
    type_name: &'static str,
}

impl EventType {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: E::TYPE_NAME,
        }
    }

    /// The event's `TYPE_NAME`.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub fn is<E: IntegrationEvent>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.type_name).finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}
