use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{EventType, IntegrationEvent, Meta, RawEnvelope, Result};

/// Published by a consumer when a handler failed on a delivery.
///
/// The failed event travels as an opaque JSON string so that any service can
/// carry it, including those that do not know the concrete type. Together with
/// the failed envelope's [`Meta`] this is enough for the recovery flow to replay
/// the delivery with its lineage intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerErrorEvent {
    pub error_message: String,
    /// Type name of the failed event, as in [`IntegrationEvent::TYPE_NAME`].
    pub failed_event_type: String,
    pub failed_event_name: String,
    pub failed_payload: String,
    pub failed_message_time: DateTime<Utc>,
    pub failed_meta: Meta,
}

impl IntegrationEvent for BrokerErrorEvent {
    const TYPE_NAME: &'static str = "BrokerErrorEvent";
}

impl BrokerErrorEvent {
    pub(crate) fn from_failure(
        envelope: &RawEnvelope,
        event_type: EventType,
        event_name: &str,
        error_message: String,
    ) -> Result<Self> {
        Ok(Self {
            error_message,
            failed_event_type: event_type.type_name().to_string(),
            failed_event_name: event_name.to_string(),
            failed_payload: serde_json::to_string(&envelope.message)?,
            failed_message_time: envelope.meta.message_time(),
            failed_meta: envelope.meta.clone(),
        })
    }

    /// Deserialize the failed payload as `E`.
    pub fn failed_event<E: DeserializeOwned>(&self) -> Result<E> {
        Ok(serde_json::from_str(&self.failed_payload)?)
    }
}
