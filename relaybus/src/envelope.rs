use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, IntegrationEvent, Meta, Result};

/// Event plus the delivery metadata transmitted with it.
///
/// - `meta`: lineage and provenance, see [`Meta`].
/// - `message`: the typed event payload.
///
/// On the wire the envelope is a single JSON object: the `meta` fields sit at
/// the top level and the event is nested under the `message` key. The event
/// name is not part of the payload, it travels as the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
    #[serde(flatten)]
    pub meta: Meta,
    pub message: E,
}

/// Envelope whose payload has not yet been bound to a concrete event type.
pub type RawEnvelope = Envelope<Value>;

impl<E: IntegrationEvent> Envelope<E> {
    /// Start a new causal chain.
    ///
    /// Mints a fresh `message_id` with `hop_level` and `requeue_count` at zero.
    /// When `correlation_id` is `None` a new one is generated.
    pub fn new_root<P>(event: E, producer: P, correlation_id: Option<String>) -> Result<Self>
    where
        P: Into<String>,
    {
        let producer = producer.into();
        if producer.trim().is_empty() {
            return Err(Error::invalid_argument("envelope producer must not be blank"));
        }
        Ok(Self {
            meta: Meta::root(producer, correlation_id),
            message: event,
        })
    }

    /// Envelope for an event published while handling the `parent` delivery.
    ///
    /// Copies the correlation id and provenance, advances `hop_level` by one and
    /// references the parent through `parent_message_id`. The message id is
    /// never copied.
    pub fn derive(parent: &Meta, event: E) -> Self {
        Self {
            meta: parent.child(),
            message: event,
        }
    }

    /// Like [`derive`](Self::derive), additionally marking the envelope as a
    /// replay of the failed `parent` delivery.
    pub fn requeue(parent: &Meta, event: E) -> Self {
        Self {
            meta: parent.replay(),
            message: event,
        }
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.meta.producer = producer.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.meta.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.meta.role = Some(role.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.meta.channel = Some(channel.into());
        self
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        RawEnvelope::parse(bytes)?.decode()
    }
}

impl RawEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Bind the payload to the concrete event type `E`.
    ///
    /// Fails with [`Error::InvalidArgument`] when the envelope carries no event.
    pub fn decode<E: IntegrationEvent>(self) -> Result<Envelope<E>> {
        if self.message.is_null() {
            return Err(Error::invalid_argument(format!(
                "envelope {} carries no message",
                self.meta.message_id
            )));
        }
        Ok(Envelope {
            message: serde_json::from_value(self.message)?,
            meta: self.meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntegrationEvent)]
    struct OrderStartedEto {
        order_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntegrationEvent)]
    struct ShipmentStarted {
        order_id: u64,
        carrier: Option<String>,
    }

    fn root() -> Envelope<OrderStartedEto> {
        Envelope::new_root(OrderStartedEto { order_id: 7 }, "orders", Some("corr-7".into()))
            .unwrap()
            .with_user("u-1")
            .with_role("admin")
            .with_channel("web")
    }

    #[test]
    fn test_new_root() {
        let env = root();
        assert_eq!(env.meta.hop_level(), 0);
        assert_eq!(env.meta.requeue_count(), 0);
        assert_eq!(env.meta.parent_message_id(), None);
        assert_eq!(env.meta.correlation_id(), "corr-7");
        assert_eq!(env.meta.producer(), "orders");
    }

    #[test]
    fn test_blank_producer_is_rejected() {
        let err = Envelope::new_root(OrderStartedEto { order_id: 1 }, "  ", None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_derive_copies_lineage() {
        let parent = root();
        let child = Envelope::derive(
            &parent.meta,
            ShipmentStarted {
                order_id: 7,
                carrier: None,
            },
        );

        assert_eq!(child.meta.correlation_id(), parent.meta.correlation_id());
        assert_eq!(child.meta.hop_level(), parent.meta.hop_level() + 1);
        assert_ne!(child.meta.message_id(), parent.meta.message_id());
        assert_eq!(child.meta.parent_message_id(), Some(parent.meta.message_id()));
        assert_eq!(child.meta.user_id(), Some("u-1"));
        assert_eq!(child.meta.role(), Some("admin"));
        assert_eq!(child.meta.channel(), Some("web"));
        assert!(!child.meta.is_requeued());
    }

    #[test]
    fn test_derive_chain_keeps_counting() {
        let mut meta = root().meta;
        for expected in 1..=4 {
            meta = Envelope::derive(&meta, OrderStartedEto { order_id: 7 }).meta;
            assert_eq!(meta.hop_level(), expected);
            assert_eq!(meta.correlation_id(), "corr-7");
        }
    }

    #[test]
    fn test_requeue_marks_replay() {
        let parent = root();
        let replay = Envelope::requeue(&parent.meta, parent.message.clone());
        assert!(replay.meta.is_requeued());
        assert_eq!(replay.meta.requeue_count(), 1);
        assert_eq!(replay.meta.hop_level(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let full = root();
        let bytes = full.to_vec().unwrap();
        assert_eq!(Envelope::<OrderStartedEto>::from_slice(&bytes).unwrap(), full);

        let sparse = Envelope::new_root(
            ShipmentStarted {
                order_id: 1,
                carrier: None,
            },
            "shipping",
            None,
        )
        .unwrap();
        let bytes = sparse.to_vec().unwrap();
        assert_eq!(Envelope::<ShipmentStarted>::from_slice(&bytes).unwrap(), sparse);
    }

    #[test]
    fn test_wire_layout() {
        let env = root();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["message"]["order_id"], 7);
        assert_eq!(value["correlation_id"], "corr-7");
        assert_eq!(value["hop_level"], 0);
        assert_eq!(value["message_id"], env.meta.message_id().to_string());
        assert!(value.get("event_name").is_none());
    }

    #[test]
    fn test_decode_null_message_is_invalid() {
        let mut raw: RawEnvelope = serde_json::from_slice(&root().to_vec().unwrap()).unwrap();
        raw.message = Value::Null;
        let err = raw.decode::<OrderStartedEto>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_decode_missing_optional_fields() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "message_id": id,
            "correlation_id": "c",
            "producer": "legacy",
            "message_time": "2024-01-01T00:00:00Z",
            "message": { "order_id": 3 }
        });
        let env = RawEnvelope::parse(json.to_string().as_bytes())
            .unwrap()
            .decode::<OrderStartedEto>()
            .unwrap();
        assert_eq!(env.meta.message_id(), id);
        assert_eq!(env.meta.hop_level(), 0);
        assert_eq!(env.meta.user_id(), None);
        assert_eq!(env.message, OrderStartedEto { order_id: 3 });
    }
}
