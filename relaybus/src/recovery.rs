use std::sync::Arc;

use crate::{
    BrokerErrorEvent, Envelope, EventTypeCatalog, Handler, Meta, Publisher, RawEnvelope, Result,
    SubscriptionRegistry, transport::Transport,
};

/// What [`RequeueHandler`] did with an error event.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// The failed event was published again, with this metadata.
    Republished(Meta),
    /// The failed delivery was already replayed `max_requeue_count` times.
    LimitReached,
    /// The failed event type is not in the [`EventTypeCatalog`].
    UnknownType,
    /// The failed payload does not parse as its type anymore.
    Unparseable,
}

/// Replays failed deliveries reported through [`BrokerErrorEvent`].
///
/// Every failure is replayed at most `max_requeue_count` times. Drops are
/// terminal and only logged.
pub struct RequeueHandler<T: Transport> {
    publisher: Publisher<T>,
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<EventTypeCatalog>,
    max_requeue_count: u32,
}

impl<T: Transport> RequeueHandler<T> {
    pub fn new(
        publisher: Publisher<T>,
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<EventTypeCatalog>,
        max_requeue_count: u32,
    ) -> Self {
        Self {
            publisher,
            registry,
            catalog,
            max_requeue_count,
        }
    }

    pub async fn requeue(&self, error: &BrokerErrorEvent) -> Result<RequeueOutcome> {
        let failed = &error.failed_meta;
        if failed.requeue_count() >= self.max_requeue_count {
            tracing::warn!(
                event_name = %error.failed_event_name,
                message_id = %failed.message_id(),
                correlation_id = failed.correlation_id(),
                requeue_count = failed.requeue_count(),
                error_message = %error.error_message,
                "requeue limit reached, dropping failed event"
            );
            return Ok(RequeueOutcome::LimitReached);
        }

        let Some(entry) = self.catalog.resolve(&error.failed_event_type) else {
            tracing::error!(
                event_type = %error.failed_event_type,
                message_id = %failed.message_id(),
                "unknown event type, dropping failed event"
            );
            return Ok(RequeueOutcome::UnknownType);
        };

        let message = match entry.reparse(&error.failed_payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    event_type = %error.failed_event_type,
                    message_id = %failed.message_id(),
                    error = %e,
                    "failed payload does not match its type, dropping"
                );
                return Ok(RequeueOutcome::Unparseable);
            }
        };

        let event_name = self.registry.event_name_of(entry.event_type());
        let envelope: RawEnvelope = Envelope {
            meta: failed.replay(),
            message,
        };
        let meta = self.publisher.publish_raw(&event_name, envelope).await?;
        tracing::info!(
            event_name = %event_name,
            message_id = %meta.message_id(),
            failed_message_id = %failed.message_id(),
            requeue_count = meta.requeue_count(),
            "failed event requeued"
        );
        Ok(RequeueOutcome::Republished(meta))
    }
}

impl<T: Transport> Handler<BrokerErrorEvent> for RequeueHandler<T> {
    async fn handle(&self, envelope: Envelope<BrokerErrorEvent>) -> Result<()> {
        self.requeue(&envelope.message).await.map(drop)
    }
}
