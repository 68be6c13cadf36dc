//! Order flow example
//!
//! Two services share one in-memory broker:
//!
//! - `fulfillment` reacts to `OrderStartedEto` by publishing `ShipmentStartedEto`
//!   as a child event, so both share one correlation id.
//! - `invoicing` handles `ShipmentStartedEto` but fails the first time it sees
//!   an order. The consumer reports the failure as a `BrokerErrorEvent`, the
//!   requeue handler replays the shipment, and the second attempt succeeds.
//!
//! Run with `cargo run --example order-flow`.

use std::{collections::HashSet, sync::Mutex, time::Duration};

use relaybus::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Clone, Debug, Serialize, Deserialize, IntegrationEvent)]
struct OrderStartedEto {
    order_id: u64,
    customer: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, IntegrationEvent)]
struct ShipmentStartedEto {
    order_id: u64,
    carrier: String,
}

struct Fulfillment {
    publisher: Publisher<InMemoryTransport>,
}

impl Handler<OrderStartedEto> for Fulfillment {
    async fn handle(&self, envelope: Envelope<OrderStartedEto>) -> Result<()> {
        let order = &envelope.message;
        println!("[fulfillment] order {} for {}", order.order_id, order.customer);

        let shipment = ShipmentStartedEto {
            order_id: order.order_id,
            carrier: "postal".into(),
        };
        self.publisher.publish_child(shipment, &envelope.meta).await?;
        Ok(())
    }
}

struct Invoicing {
    seen: Mutex<HashSet<u64>>,
    done: mpsc::UnboundedSender<Meta>,
}

impl Handler<ShipmentStartedEto> for Invoicing {
    async fn handle(&self, envelope: Envelope<ShipmentStartedEto>) -> Result<()> {
        let order_id = envelope.message.order_id;
        let first_time = self
            .seen
            .lock()
            .map_err(Error::external)?
            .insert(order_id);
        if first_time {
            println!("[invoicing] ledger unavailable for order {order_id}");
            return Err(Error::external("ledger unavailable"));
        }

        println!(
            "[invoicing] invoiced order {order_id} (hop {}, requeued {} time(s))",
            envelope.meta.hop_level(),
            envelope.meta.requeue_count()
        );
        self.done.send(envelope.meta).map_err(Error::external)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::default()
        .with_client_name("shop")
        .with_consumer_parallel_thread_count(2);
    let mut bus = EventBus::new(InMemoryTransport::new(), config);

    let publisher = bus.publisher();
    bus.subscribe("fulfillment", move || Fulfillment {
        publisher: publisher.clone(),
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_shared(
        "invoicing",
        Invoicing {
            seen: Mutex::new(HashSet::new()),
            done: tx,
        },
    )?;

    bus.start().await?;
    let root = bus
        .publish_root(OrderStartedEto {
            order_id: 42,
            customer: "ada".into(),
        })
        .await?;

    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(meta)) => {
            assert_eq!(meta.correlation_id(), root.correlation_id());
            println!(
                "[main] order flow complete, correlation id {}",
                meta.correlation_id()
            );
        }
        _ => eprintln!("[main] order flow did not complete in time"),
    }

    bus.stop().await
}
