//! The broker capability the bus is written against.
//!
//! Any AMQP- or Kafka-like client can sit behind these traits: the bus only
//! connects, opens channels, declares queues, publishes bytes to a route and
//! consumes bytes from a queue with explicit acknowledgement.
//!
//! Routing is direct: an event published on route `"OrderStarted"` lands in
//! the queue named `"OrderStarted"`.

use std::future::Future;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::TransportError;

pub type TransportResult<T = ()> = std::result::Result<T, TransportError>;

/// Stream of deliveries returned by [`Channel::consume`].
///
/// The stream ends when the consumer is cancelled by the broker or the
/// connection goes away.
pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// The channel type of a transport's connections.
pub type ChannelOf<T> = <<T as Transport>::Connection as Connection>::Channel;

/// Handle used to acknowledge a delivery on the channel it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// A raw message received from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// The broker delivered this message before without an acknowledgement.
    pub redelivered: bool,
}

pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Establish one physical connection to the broker.
    fn connect(&self) -> impl Future<Output = TransportResult<Self::Connection>> + Send;
}

pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    fn create_channel(&self) -> impl Future<Output = TransportResult<Self::Channel>> + Send;

    /// Token cancelled by the transport when the connection is lost.
    fn close_signal(&self) -> CancellationToken;

    fn is_open(&self) -> bool;

    fn close(&self) -> impl Future<Output = TransportResult> + Send;
}

/// A lightweight session on a connection, owned by one task at a time.
pub trait Channel: Send + 'static {
    fn declare_queue(&mut self, queue: &str) -> impl Future<Output = TransportResult> + Send;

    fn publish(
        &mut self,
        route: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = TransportResult> + Send;

    /// Start consuming `queue`, with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    fn consume(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> impl Future<Output = TransportResult<DeliveryStream>> + Send;

    fn ack(&mut self, tag: DeliveryTag) -> impl Future<Output = TransportResult> + Send;

    /// Reject a delivery. With `requeue` the broker delivers it again,
    /// otherwise it is dead-lettered.
    fn nack(
        &mut self,
        tag: DeliveryTag,
        requeue: bool,
    ) -> impl Future<Output = TransportResult> + Send;

    fn close(self) -> impl Future<Output = TransportResult> + Send;
}
