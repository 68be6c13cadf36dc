use std::sync::Arc;

use crate::{
    BrokerErrorEvent, Config, ConnectionManager, Consumer, ConsumerHandle, Error, EventTypeCatalog,
    Handler, HandlerCatalog, HandlerId, IntegrationEvent, Meta, Publisher, RequeueHandler, Result,
    SubscriptionRegistry, transport::Transport,
};

const REQUEUE_HANDLER: &str = "relaybus.requeue";

/// Wires registry, connection, publisher and consumers together.
///
/// - Subscribe handlers with `subscribe(name, || Handler)` before starting.
/// - `register_event::<E>()` makes types this process only publishes
///   replayable by the recovery flow.
/// - `start()` connects, subscribes the requeue handler (unless disabled) and
///   spawns the consumers. It returns immediately.
/// - `publish*` sends events, before or after `start()`.
/// - `stop()` shuts the consumers down and closes the connection.
///
/// # Examples
///
/// ```rust
/// use relaybus::{Config, Envelope, EventBus, Handler, InMemoryTransport, IntegrationEvent, Result};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize, IntegrationEvent)]
/// struct OrderStartedEto {
///     order_id: u64,
/// }
///
/// struct Fulfillment;
///
/// impl Handler<OrderStartedEto> for Fulfillment {
///     async fn handle(&self, envelope: Envelope<OrderStartedEto>) -> Result<()> {
///         println!("fulfilling order {}", envelope.message.order_id);
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<()> {
/// let mut bus = EventBus::new(InMemoryTransport::new(), Config::default());
/// bus.subscribe("fulfillment", || Fulfillment)?;
/// bus.start().await?;
/// bus.publish_root(OrderStartedEto { order_id: 1 }).await?;
/// bus.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus<T: Transport> {
    config: Config,
    registry: Arc<SubscriptionRegistry>,
    catalog: EventTypeCatalog,
    handlers: HandlerCatalog,
    connection: Arc<ConnectionManager<T>>,
    publisher: Publisher<T>,
    consumers: Option<ConsumerHandle>,
}

impl<T: Transport> EventBus<T> {
    pub fn new(transport: T, config: Config) -> Self {
        let registry = Arc::new(SubscriptionRegistry::from_config(&config));
        let connection = ConnectionManager::new(transport, &config);
        let publisher = Publisher::new(connection.clone(), registry.clone(), &config);
        Self {
            catalog: EventTypeCatalog::new().with::<BrokerErrorEvent>(),
            handlers: HandlerCatalog::new(),
            consumers: None,
            config,
            registry,
            connection,
            publisher,
        }
    }

    /// Subscribe a handler built by `factory` for every delivery.
    ///
    /// Fails with [`Error::DuplicateRegistration`] if `name` is already
    /// subscribed to `E`.
    pub fn subscribe<E, H, F>(&mut self, name: &str, factory: F) -> Result<HandlerId>
    where
        E: IntegrationEvent,
        H: Handler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let id = self.register::<E>(name)?;
        self.handlers.add::<E, H, F>(id.clone(), factory);
        Ok(id)
    }

    /// Subscribe one handler instance shared by all deliveries.
    pub fn subscribe_shared<E, H>(&mut self, name: &str, handler: H) -> Result<HandlerId>
    where
        E: IntegrationEvent,
        H: Handler<E>,
    {
        let id = self.register::<E>(name)?;
        self.handlers.add_shared::<E, H>(id.clone(), handler);
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: &HandlerId) -> Result<()> {
        self.ensure_stopped()?;
        self.registry.unregister(id.accepts(), id);
        self.handlers.remove(id);
        Ok(())
    }

    /// Make `E` known to the recovery flow without subscribing to it.
    pub fn register_event<E: IntegrationEvent>(&mut self) -> &mut Self {
        self.catalog.register::<E>();
        self
    }

    pub async fn start(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        self.connection.ensure_connected().await?;

        if self.config.enable_recovery {
            let id = HandlerId::new::<BrokerErrorEvent>(REQUEUE_HANDLER);
            if !self.handlers.contains(&id) {
                let requeue = RequeueHandler::new(
                    self.publisher.clone(),
                    self.registry.clone(),
                    Arc::new(self.catalog.clone()),
                    self.config.max_requeue_count,
                );
                self.registry.register_for::<BrokerErrorEvent>(id.clone())?;
                self.handlers.add_shared::<BrokerErrorEvent, _>(id, requeue);
            }
        }

        let consumer = Consumer::new(
            self.connection.clone(),
            self.registry.clone(),
            Arc::new(self.handlers.clone()),
            self.publisher.clone(),
            &self.config,
        );
        self.consumers = Some(consumer.start());
        tracing::info!(
            client_name = %self.config.client_name,
            events = ?self.registry.event_names(),
            "event bus started"
        );
        Ok(())
    }

    /// Stop the consumers and close the broker connection.
    ///
    /// The bus cannot be started again afterwards.
    pub async fn stop(&mut self) -> Result<()> {
        let stopped = match self.consumers.take() {
            Some(consumers) => consumers.stop().await,
            None => Ok(()),
        };
        self.connection.close().await?;
        tracing::info!(client_name = %self.config.client_name, "event bus stopped");
        stopped
    }

    /// See [`Publisher::publish`].
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: E,
        parent: Option<&Meta>,
        is_requeue_publish: bool,
    ) -> Result<Meta> {
        self.publisher.publish(event, parent, is_requeue_publish).await
    }

    pub async fn publish_root<E: IntegrationEvent>(&self, event: E) -> Result<Meta> {
        self.publisher.publish_root(event).await
    }

    pub async fn publish_child<E: IntegrationEvent>(&self, event: E, parent: &Meta) -> Result<Meta> {
        self.publisher.publish_child(event, parent).await
    }

    pub fn is_started(&self) -> bool {
        self.consumers.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &EventTypeCatalog {
        &self.catalog
    }

    /// A publisher handlers can keep to publish follow-up events.
    pub fn publisher(&self) -> Publisher<T> {
        self.publisher.clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    fn register<E: IntegrationEvent>(&mut self, name: &str) -> Result<HandlerId> {
        self.ensure_stopped()?;
        let id = HandlerId::new::<E>(name);
        self.registry.register_for::<E>(id.clone())?;
        self.catalog.register::<E>();
        Ok(id)
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }
}
