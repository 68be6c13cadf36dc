//! Relaybus - integration event bus over a message broker
//!
//! Services publish typed integration events; every event type is routed to a
//! queue named after it and consumed by the handlers subscribed to it. Each
//! envelope carries lineage metadata (correlation id, parent message, hop
//! level) so causal chains can be followed across services.
//!
//! Failed handlers do not make the broker redeliver. Instead a
//! [`BrokerErrorEvent`] is published, and the [`RequeueHandler`] replays the
//! failed event a bounded number of times.
//!
//! The broker itself is abstracted by the traits in [`transport`];
//! [`InMemoryTransport`] implements them in-process.
//!
//! See `examples/order-flow.rs`.

extern crate self as relaybus;

mod bus;
mod catalog;
mod config;
mod connection;
mod consumer;
mod envelope;
mod error;
mod error_event;
mod event;
mod event_name;
mod handler;
mod meta;
mod publisher;
mod recovery;
mod registry;
mod retry_policy;

mod internal;

pub mod memory;
pub mod transport;

pub use bus::EventBus;
pub use catalog::{CatalogEntry, EventTypeCatalog};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{Consumer, ConsumerHandle};
pub use envelope::{Envelope, RawEnvelope};
pub use error::{Error, TransportError};
pub use error_event::BrokerErrorEvent;
pub use event::{EventType, IntegrationEvent};
pub use event_name::EventNaming;
pub use handler::{DynHandler, Handler, HandlerCatalog, HandlerId, HandlerResolver, erase};
pub use memory::InMemoryTransport;
pub use meta::Meta;
pub use publisher::Publisher;
pub use recovery::{RequeueHandler, RequeueOutcome};
pub use registry::SubscriptionRegistry;
pub use retry_policy::RetryPolicy;
pub use transport::{Channel, Connection, Delivery, DeliveryTag, Transport};

#[cfg(feature = "macros")]
pub use relaybus_macros::IntegrationEvent;

pub type Result<T = ()> = std::result::Result<T, Error>;
