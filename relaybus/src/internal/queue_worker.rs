use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    ConnectionManager, Result, RetryPolicy,
    internal::{Dispatcher, Settlement},
    transport::{Channel, ChannelOf, Delivery, DeliveryStream, Transport},
};

/// One consumer of one queue.
///
/// Runs until cancelled. If the channel or its delivery stream fails, the
/// worker opens a new one after a backoff delay.
pub(crate) struct QueueWorker<T: Transport> {
    pub(crate) event_name: String,
    pub(crate) index: usize,
    pub(crate) connection: Arc<ConnectionManager<T>>,
    pub(crate) dispatcher: Arc<Dispatcher<T>>,
    pub(crate) prefetch: u16,
    pub(crate) policy: RetryPolicy,
    pub(crate) cancel_token: CancellationToken,
}

impl<T: Transport> QueueWorker<T> {
    pub async fn run(self) -> Result<()> {
        let mut failures = 0;
        while !self.cancel_token.is_cancelled() {
            match self.subscribe().await {
                Ok((channel, deliveries)) => {
                    failures = 0;
                    self.drain(channel, deliveries).await;
                }
                Err(e) => {
                    tracing::warn!(
                        event_name = %self.event_name,
                        worker = self.index,
                        error = %e,
                        "could not start consuming"
                    );
                }
            }

            let delay = self.policy.delay(failures);
            failures = failures.saturating_add(1);
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(event_name = %self.event_name, worker = self.index, "consumer worker stopped");
        Ok(())
    }

    async fn subscribe(&self) -> Result<(ChannelOf<T>, DeliveryStream)> {
        self.connection.ensure_connected().await?;
        let mut channel = self.connection.open_channel().await?;
        channel.declare_queue(&self.event_name).await?;
        let deliveries = channel.consume(&self.event_name, self.prefetch).await?;
        tracing::debug!(event_name = %self.event_name, worker = self.index, "consuming");
        Ok((channel, deliveries))
    }

    async fn drain(&self, mut channel: ChannelOf<T>, mut deliveries: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.process(&mut channel, delivery).await,
                Some(Err(e)) => {
                    tracing::warn!(event_name = %self.event_name, error = %e, "delivery stream failed");
                    break;
                }
                None => {
                    tracing::debug!(event_name = %self.event_name, "delivery stream ended");
                    break;
                }
            }
        }

        drop(deliveries);
        if let Err(e) = channel.close().await {
            tracing::debug!(event_name = %self.event_name, error = %e, "failed to close consumer channel");
        }
    }

    async fn process(&self, channel: &mut ChannelOf<T>, delivery: Delivery) {
        let settlement = self
            .dispatcher
            .dispatch(&self.event_name, &delivery.payload)
            .await;
        let outcome = match settlement {
            Settlement::Ack => channel.ack(delivery.tag).await,
            Settlement::Requeue => channel.nack(delivery.tag, true).await,
            Settlement::Reject => channel.nack(delivery.tag, false).await,
        };
        if let Err(e) = outcome {
            // The broker redelivers unsettled messages once the channel goes away.
            tracing::warn!(
                event_name = %self.event_name,
                tag = delivery.tag.0,
                ?settlement,
                error = %e,
                "failed to settle delivery"
            );
        }
    }
}
