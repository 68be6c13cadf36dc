use std::sync::Arc;

use crate::{
    BrokerErrorEvent, Envelope, EventType, HandlerResolver, Publisher, RawEnvelope, Result,
    SubscriptionRegistry, transport::Transport,
};

/// What to tell the broker about a delivery once it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    /// Deliver again later; nothing was recorded about the failure.
    Requeue,
    /// Drop, or dead-letter if the broker is set up for it.
    Reject,
}

/// Routes one delivery to every handler subscribed to its event name.
pub(crate) struct Dispatcher<T: Transport> {
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) resolver: Arc<dyn HandlerResolver>,
    pub(crate) publisher: Publisher<T>,
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) async fn dispatch(&self, event_name: &str, payload: &[u8]) -> Settlement {
        let envelope = match RawEnvelope::parse(payload) {
            Ok(envelope) if !envelope.message.is_null() => envelope,
            Ok(envelope) => {
                tracing::error!(
                    event_name,
                    message_id = %envelope.meta.message_id(),
                    "delivery carries no message, rejecting"
                );
                return Settlement::Reject;
            }
            Err(e) => {
                tracing::error!(event_name, error = %e, "undecodable delivery, rejecting");
                return Settlement::Reject;
            }
        };

        let (event_type, handlers) = match self
            .registry
            .resolve_type(event_name)
            .and_then(|t| Ok((t, self.registry.handlers_for(event_name)?)))
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(event_name, error = %e, "no subscription for delivery, rejecting");
                return Settlement::Reject;
            }
        };

        let mut failures = Vec::new();
        let mut retryable = false;
        for id in &handlers {
            let Some(handler) = self.resolver.resolve(id) else {
                failures.push(format!("{id}: handler could not be resolved"));
                continue;
            };
            if let Err(e) = handler.handle_raw(envelope.clone()).await {
                tracing::warn!(
                    event_name,
                    handler = %id,
                    message_id = %envelope.meta.message_id(),
                    correlation_id = envelope.meta.correlation_id(),
                    error = %e,
                    "handler failed"
                );
                retryable |= e.is_retryable();
                failures.push(format!("{id}: {e}"));
            }
        }

        if failures.is_empty() {
            return Settlement::Ack;
        }

        if event_type.is::<BrokerErrorEvent>() {
            if retryable {
                tracing::warn!(
                    event_name,
                    message_id = %envelope.meta.message_id(),
                    "error event handling hit the broker, requeueing"
                );
                return Settlement::Requeue;
            }
            tracing::error!(
                event_name,
                message_id = %envelope.meta.message_id(),
                "error event handling failed, rejecting"
            );
            return Settlement::Reject;
        }

        match self
            .report(&envelope, event_type, event_name, failures.join("; "))
            .await
        {
            Ok(()) => Settlement::Ack,
            Err(e) => {
                tracing::error!(
                    event_name,
                    message_id = %envelope.meta.message_id(),
                    error = %e,
                    "could not publish error event, requeueing delivery"
                );
                Settlement::Requeue
            }
        }
    }

    async fn report(
        &self,
        envelope: &RawEnvelope,
        event_type: EventType,
        event_name: &str,
        error_message: String,
    ) -> Result<()> {
        let error = BrokerErrorEvent::from_failure(envelope, event_type, event_name, error_message)?;
        let report = Envelope::new_root(
            error,
            self.publisher.producer(),
            Some(envelope.meta.correlation_id().to_string()),
        )?;
        let meta = self.publisher.send(report).await?;
        tracing::info!(
            event_name,
            failed_message_id = %envelope.meta.message_id(),
            error_message_id = %meta.message_id(),
            "published error event for failed delivery"
        );
        Ok(())
    }
}
