use std::sync::Arc;

use crate::{
    Config, ConnectionManager, Envelope, Error, IntegrationEvent, Meta, RawEnvelope, Result,
    RetryPolicy, SubscriptionRegistry,
    transport::{Channel, Transport},
};

/// Sends events to the broker.
///
/// Each publish opens a short-lived channel, declares the event's queue and
/// publishes the envelope on the route named after the event. Connection and
/// transport failures are retried with backoff; once the attempts run out the
/// call fails with [`Error::PublishFailed`] and nothing is buffered. While the
/// connection is being re-established in the background a publish fails at
/// once with [`Error::ConnectionUnavailable`].
///
/// Cheap to clone. Handlers that publish follow-up events keep a clone.
pub struct Publisher<T: Transport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    registry: Arc<SubscriptionRegistry>,
    producer: String,
    attempts: u32,
    policy: RetryPolicy,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Publisher<T> {
    pub fn new(
        connection: Arc<ConnectionManager<T>>,
        registry: Arc<SubscriptionRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                registry,
                producer: config.client_name.clone(),
                attempts: config.attempts(),
                policy: config.retry_policy,
            }),
        }
    }

    /// Name stamped as `producer` on every published envelope.
    pub fn producer(&self) -> &str {
        &self.inner.producer
    }

    /// Publish `event` and return the metadata it was sent with.
    ///
    /// - Without `parent` the event starts a new causal chain.
    /// - With `parent` it is derived from that delivery (same correlation id,
    ///   one hop further).
    /// - `is_requeue_publish` marks a replay of the failed `parent` delivery and
    ///   requires one.
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: E,
        parent: Option<&Meta>,
        is_requeue_publish: bool,
    ) -> Result<Meta> {
        let envelope = match (parent, is_requeue_publish) {
            (None, false) => Envelope::new_root(event, self.producer(), None)?,
            (Some(parent), false) => Envelope::derive(parent, event),
            (Some(parent), true) => Envelope::requeue(parent, event),
            (None, true) => {
                return Err(Error::invalid_argument(
                    "a requeue publish needs the failed envelope as parent",
                ));
            }
        };
        self.send(envelope).await
    }

    pub async fn publish_root<E: IntegrationEvent>(&self, event: E) -> Result<Meta> {
        self.publish(event, None, false).await
    }

    pub async fn publish_child<E: IntegrationEvent>(&self, event: E, parent: &Meta) -> Result<Meta> {
        self.publish(event, Some(parent), false).await
    }

    /// Publish a prepared envelope, e.g. one carrying user or channel provenance.
    ///
    /// The envelope is stamped with this publisher's producer name.
    pub async fn send<E: IntegrationEvent>(&self, envelope: Envelope<E>) -> Result<Meta> {
        let envelope = envelope.with_producer(self.producer());
        let event_name = self.inner.registry.event_name::<E>();
        self.publish_bytes(&event_name, envelope.to_vec()?, &envelope.meta)
            .await?;
        Ok(envelope.meta)
    }

    /// Publish an envelope whose payload was already validated against its type.
    pub(crate) async fn publish_raw(&self, event_name: &str, mut envelope: RawEnvelope) -> Result<Meta> {
        envelope.meta.producer = self.inner.producer.clone();
        self.publish_bytes(event_name, serde_json::to_vec(&envelope)?, &envelope.meta)
            .await?;
        Ok(envelope.meta)
    }

    async fn publish_bytes(&self, event_name: &str, payload: Vec<u8>, meta: &Meta) -> Result<()> {
        let attempts = self.inner.attempts;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.inner.policy.delay(attempt - 1)).await;
            }
            match self.try_publish(event_name, payload.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        event_name,
                        message_id = %meta.message_id(),
                        correlation_id = meta.correlation_id(),
                        hop_level = meta.hop_level(),
                        "event published"
                    );
                    return Ok(());
                }
                Err(e @ Error::ConnectionUnavailable(_)) if self.inner.connection.is_reconnecting() => {
                    tracing::warn!(
                        event_name,
                        message_id = %meta.message_id(),
                        error = %e,
                        "broker connection is recovering, not retrying publish"
                    );
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        event_name,
                        message_id = %meta.message_id(),
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "publish attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        tracing::error!(event_name, message_id = %meta.message_id(), %reason, "giving up on publish");
        Err(Error::PublishFailed {
            event_name: event_name.to_string(),
            attempts,
            reason: reason.into(),
        })
    }

    async fn try_publish(&self, event_name: &str, payload: Vec<u8>) -> Result<()> {
        self.inner.connection.ensure_connected().await?;
        let mut channel = self.inner.connection.open_channel().await?;
        let outcome = match channel.declare_queue(event_name).await {
            Ok(()) => channel.publish(event_name, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = channel.close().await {
            tracing::debug!(event_name, error = %e, "failed to close publish channel");
        }
        Ok(outcome?)
    }
}
