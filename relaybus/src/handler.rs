use std::{collections::HashMap, fmt, future::Future, hash::Hash, marker::PhantomData, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{Envelope, EventType, IntegrationEvent, RawEnvelope, Result};

/// Application code reacting to one event type.
///
/// Equivalent to:
///
/// ```ignore
/// async fn handle(&self, envelope: Envelope<E>) -> Result<()>;
/// ```
///
/// Returning an error does not cause a transport-level redelivery. The consumer
/// converts it into a [`BrokerErrorEvent`](crate::BrokerErrorEvent) which the
/// recovery flow may replay later, so handlers must tolerate seeing the same
/// event more than once. Handlers may run concurrently with each other.
///
/// To publish follow-up events, keep a [`Publisher`](crate::Publisher) in the
/// handler and pass `&envelope.meta` as the parent.
pub trait Handler<E: IntegrationEvent>: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope<E>) -> impl Future<Output = Result<()>> + Send;
}

/// Identifier of a registered handler together with the event type it accepts.
///
/// Two ids are equal when their names are equal.
#[derive(Clone)]
pub struct HandlerId {
    name: Arc<str>,
    accepts: EventType,
}

impl HandlerId {
    pub fn new<E: IntegrationEvent>(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            accepts: EventType::of::<E>(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event type the handler behind this id consumes.
    #[inline]
    pub fn accepts(&self) -> EventType {
        self.accepts
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for HandlerId {}

impl Hash for HandlerId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerId")
            .field("name", &self.name)
            .field("accepts", &self.accepts)
            .finish()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Type-erased handler, as invoked by the consumer loop.
pub trait DynHandler: Send + Sync {
    fn accepts(&self) -> EventType;

    /// Decode the raw envelope into the accepted type and handle it.
    fn handle_raw(&self, envelope: RawEnvelope) -> BoxFuture<'_, Result<()>>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> DynHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: Handler<E>,
{
    fn accepts(&self) -> EventType {
        EventType::of::<E>()
    }

    fn handle_raw(&self, envelope: RawEnvelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let envelope = envelope.decode::<E>()?;
            self.handler.handle(envelope).await
        })
    }
}

/// Wrap a typed handler for dynamic dispatch.
pub fn erase<E, H>(handler: H) -> Arc<dyn DynHandler>
where
    E: IntegrationEvent,
    H: Handler<E>,
{
    Arc::new(TypedHandler {
        handler,
        _event: PhantomData::<fn() -> E>,
    })
}

/// Produces an invocable handler for a [`HandlerId`].
///
/// Usually backed by whatever constructs application services; the bus only
/// needs this single capability.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, id: &HandlerId) -> Option<Arc<dyn DynHandler>>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn DynHandler> + Send + Sync>;

/// Map-backed [`HandlerResolver`].
///
/// Handlers added with [`add`](Self::add) are built by their factory on every
/// resolution. Handlers added with [`add_shared`](Self::add_shared) are a
/// single instance reused for every delivery.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    factories: HashMap<HandlerId, Factory>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<E, H, F>(&mut self, id: HandlerId, factory: F)
    where
        E: IntegrationEvent,
        H: Handler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories
            .insert(id, Arc::new(move || erase::<E, H>(factory())));
    }

    pub fn add_shared<E, H>(&mut self, id: HandlerId, handler: H)
    where
        E: IntegrationEvent,
        H: Handler<E>,
    {
        let handler = erase::<E, H>(handler);
        self.factories.insert(id, Arc::new(move || handler.clone()));
    }

    pub fn remove(&mut self, id: &HandlerId) -> bool {
        self.factories.remove(id).is_some()
    }

    pub fn contains(&self, id: &HandlerId) -> bool {
        self.factories.contains_key(id)
    }
}

impl HandlerResolver for HandlerCatalog {
    fn resolve(&self, id: &HandlerId) -> Option<Arc<dyn DynHandler>> {
        self.factories.get(id).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntegrationEvent)]
    struct OrderStarted {
        order_id: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, IntegrationEvent)]
    struct OrderCancelled;

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    impl Handler<OrderStarted> for Counting {
        async fn handle(&self, envelope: Envelope<OrderStarted>) -> Result<()> {
            if envelope.message.order_id == 0 {
                return Err(Error::external("order id must be positive"));
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn raw(order_id: u64) -> RawEnvelope {
        let env = Envelope::new_root(OrderStarted { order_id }, "orders", None).unwrap();
        RawEnvelope::parse(&env.to_vec().unwrap()).unwrap()
    }

    #[test]
    fn test_handler_id_equality_by_name() {
        let a = HandlerId::new::<OrderStarted>("audit");
        let b = HandlerId::new::<OrderCancelled>("audit");
        assert_eq!(a, b);
        assert_eq!(a.accepts(), EventType::of::<OrderStarted>());
        assert_eq!(a.to_string(), "audit");
    }

    #[tokio::test]
    async fn test_catalog_builds_handler_per_resolution() {
        let seen = Arc::new(AtomicUsize::new(0));
        let built = Arc::new(AtomicUsize::new(0));
        let id = HandlerId::new::<OrderStarted>("counting");

        let mut catalog = HandlerCatalog::new();
        {
            let seen = seen.clone();
            let built = built.clone();
            catalog.add(id.clone(), move || {
                built.fetch_add(1, Ordering::SeqCst);
                Counting { seen: seen.clone() }
            });
        }

        for order_id in 1..=2 {
            let handler = catalog.resolve(&id).expect("registered");
            assert_eq!(handler.accepts(), EventType::of::<OrderStarted>());
            handler.handle_raw(raw(order_id)).await.unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_surface() {
        let id = HandlerId::new::<OrderStarted>("counting");
        let mut catalog = HandlerCatalog::new();
        catalog.add_shared(
            id.clone(),
            Counting {
                seen: Arc::new(AtomicUsize::new(0)),
            },
        );
        let handler = catalog.resolve(&id).unwrap();
        assert!(matches!(
            handler.handle_raw(raw(0)).await,
            Err(Error::External(_))
        ));
    }

    #[test]
    fn test_unknown_handler_is_not_resolved() {
        let catalog = HandlerCatalog::new();
        assert!(catalog.resolve(&HandlerId::new::<OrderStarted>("nope")).is_none());
    }
}
