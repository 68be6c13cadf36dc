//! End-to-end propagation of delivery metadata across a causal chain.

use std::time::Duration;

use relaybus::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, IntegrationEvent)]
struct OrderStartedEto {
    order_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, IntegrationEvent)]
struct ShipmentStartedEto {
    order_id: u64,
}

struct Fulfillment {
    publisher: Publisher<InMemoryTransport>,
    seen: mpsc::UnboundedSender<Meta>,
}

impl Handler<OrderStartedEto> for Fulfillment {
    async fn handle(&self, envelope: Envelope<OrderStartedEto>) -> Result<()> {
        let shipment = ShipmentStartedEto {
            order_id: envelope.message.order_id,
        };
        self.publisher.publish_child(shipment, &envelope.meta).await?;
        self.seen.send(envelope.meta).map_err(Error::external)
    }
}

struct Shipping {
    seen: mpsc::UnboundedSender<Envelope<ShipmentStartedEto>>,
}

impl Handler<ShipmentStartedEto> for Shipping {
    async fn handle(&self, envelope: Envelope<ShipmentStartedEto>) -> Result<()> {
        self.seen.send(envelope).map_err(Error::external)
    }
}

fn config() -> Config {
    Config::default()
        .with_client_name("shop")
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5)))
        .with_shutdown_grace_period(Duration::from_millis(200))
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_event_keeps_lineage() -> Result {
    let mut bus = EventBus::new(InMemoryTransport::new(), config());
    let (orders_tx, mut orders_rx) = mpsc::unbounded_channel();
    let (shipments_tx, mut shipments_rx) = mpsc::unbounded_channel();

    bus.subscribe_shared(
        "fulfillment",
        Fulfillment {
            publisher: bus.publisher(),
            seen: orders_tx,
        },
    )?;
    bus.subscribe_shared("shipping", Shipping { seen: shipments_tx })?;
    bus.start().await?;

    let root = Envelope::new_root(OrderStartedEto { order_id: 7 }, "web", Some("corr-7".into()))?
        .with_user("user-1")
        .with_role("customer")
        .with_channel("mobile");
    let root_meta = bus.publisher().send(root).await?;

    let order_meta = recv(&mut orders_rx).await;
    assert_eq!(order_meta, root_meta);
    assert_eq!(order_meta.hop_level(), 0);
    assert_eq!(order_meta.producer(), "shop");

    let shipment = recv(&mut shipments_rx).await;
    assert_eq!(shipment.message, ShipmentStartedEto { order_id: 7 });
    assert_eq!(shipment.meta.correlation_id(), "corr-7");
    assert_eq!(shipment.meta.parent_message_id(), Some(root_meta.message_id()));
    assert_ne!(shipment.meta.message_id(), root_meta.message_id());
    assert_eq!(shipment.meta.hop_level(), 1);
    assert_eq!(shipment.meta.user_id(), Some("user-1"));
    assert_eq!(shipment.meta.role(), Some("customer"));
    assert_eq!(shipment.meta.channel(), Some("mobile"));
    assert!(!shipment.meta.is_requeued());
    assert!(shipment.meta.message_time() >= root_meta.message_time());

    bus.stop().await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_route_by_stripped_name() -> Result {
    let transport = InMemoryTransport::new();
    let bus = EventBus::new(transport.clone(), config());

    bus.publish_root(OrderStartedEto { order_id: 1 }).await?;
    bus.publish_root(ShipmentStartedEto { order_id: 1 }).await?;

    assert_eq!(transport.published_count("OrderStarted"), 1);
    assert_eq!(transport.published_count("ShipmentStarted"), 1);
    assert_eq!(transport.published_count("OrderStartedEto"), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prefix_and_suffixes_are_configurable() -> Result {
    let transport = InMemoryTransport::new();
    let config = config()
        .with_event_name_prefix("Order")
        .with_event_name_suffixes(["Eto"]);
    let bus = EventBus::new(transport.clone(), config);

    bus.publish_root(OrderStartedEto { order_id: 1 }).await?;
    assert_eq!(transport.published_count("Started"), 1);
    Ok(())
}
