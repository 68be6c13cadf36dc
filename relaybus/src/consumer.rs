use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    Config, ConnectionManager, HandlerResolver, Publisher, Result, RetryPolicy,
    SubscriptionRegistry,
    internal::{Dispatcher, QueueWorker},
    transport::Transport,
};

/// Consumes every subscribed queue and dispatches deliveries to handlers.
///
/// For each event name that has subscribers, `consumer_parallel_thread_count`
/// workers consume the queue of that name. A delivery is acknowledged after
/// every handler succeeded. When a handler fails, a
/// [`BrokerErrorEvent`](crate::BrokerErrorEvent) is published and the delivery
/// is acknowledged; if even that publish fails, the delivery is returned to the
/// queue.
///
/// The set of queues is fixed when [`start`](Self::start) is called.
pub struct Consumer<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    dispatcher: Arc<Dispatcher<T>>,
    workers_per_queue: usize,
    prefetch: u16,
    policy: RetryPolicy,
    grace_period: Duration,
}

impl<T: Transport> Consumer<T> {
    pub fn new(
        connection: Arc<ConnectionManager<T>>,
        registry: Arc<SubscriptionRegistry>,
        resolver: Arc<dyn HandlerResolver>,
        publisher: Publisher<T>,
        config: &Config,
    ) -> Self {
        Self {
            connection,
            dispatcher: Arc::new(Dispatcher {
                registry,
                resolver,
                publisher,
            }),
            workers_per_queue: config.workers_per_queue(),
            prefetch: config.prefetch(),
            policy: config.retry_policy,
            grace_period: config.shutdown_grace_period,
        }
    }

    /// Spawn the workers on the current Tokio runtime.
    pub fn start(self) -> ConsumerHandle {
        let cancel_token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let event_names = self.dispatcher.registry.event_names();
        if event_names.is_empty() {
            tracing::warn!("no subscriptions, consumer has nothing to do");
        }

        for event_name in event_names {
            for index in 0..self.workers_per_queue {
                let worker = QueueWorker {
                    event_name: event_name.clone(),
                    index,
                    connection: self.connection.clone(),
                    dispatcher: self.dispatcher.clone(),
                    prefetch: self.prefetch,
                    policy: self.policy,
                    cancel_token: cancel_token.clone(),
                };
                tasks.spawn(worker.run());
            }
            tracing::info!(
                event_name = %event_name,
                workers = self.workers_per_queue,
                "consumer started"
            );
        }

        ConsumerHandle {
            tasks,
            cancel_token,
            grace_period: self.grace_period,
        }
    }
}

/// Controls the workers spawned by [`Consumer::start`].
///
/// Dropping the handle leaves the workers running until the runtime shuts
/// down; call [`stop`](Self::stop) for an orderly shutdown.
pub struct ConsumerHandle {
    tasks: JoinSet<Result<()>>,
    cancel_token: CancellationToken,
    grace_period: Duration,
}

impl ConsumerHandle {
    /// Stop taking new deliveries. Handlers already running are not interrupted.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Number of workers still running.
    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until [`shutdown`](Self::shutdown) is requested, then for the
    /// workers to finish.
    ///
    /// Workers get `shutdown_grace_period` to complete their in-flight
    /// deliveries, after which the remaining ones are aborted. Unacknowledged
    /// deliveries of aborted workers are redelivered by the broker.
    pub async fn join(mut self) -> Result<()> {
        self.cancel_token.cancelled().await;

        let grace_period = self.grace_period;
        let drained = tokio::time::timeout(grace_period, Self::drain(&mut self.tasks)).await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    remaining = self.tasks.len(),
                    ?grace_period,
                    "consumer workers did not stop in time, aborting"
                );
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
                Ok(())
            }
        }
    }

    /// [`shutdown`](Self::shutdown) followed by [`join`](Self::join).
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }

    async fn drain(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
        let mut outcome = Ok(());
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "consumer worker failed");
                    outcome = Err(e);
                }
                Err(e) => outcome = Err(e.into()),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Envelope, Error, Handler, HandlerCatalog, HandlerId, InMemoryTransport, IntegrationEvent,
        transport::{Channel, Connection},
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntegrationEvent)]
    struct OrderStarted {
        order_id: u64,
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl Handler<OrderStarted> for Counter {
        async fn handle(&self, _envelope: Envelope<OrderStarted>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Blocking(Arc<Notify>);

    impl Handler<OrderStarted> for Blocking {
        async fn handle(&self, _envelope: Envelope<OrderStarted>) -> Result<()> {
            self.0.notify_one();
            std::future::pending::<()>().await;
            Err(Error::external("unreachable"))
        }
    }

    fn config() -> Config {
        Config::default()
            .with_connection_retry_count(3)
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5)))
            .with_shutdown_grace_period(Duration::from_millis(50))
    }

    fn consumer(
        transport: &InMemoryTransport,
        config: &Config,
        handler: impl Handler<OrderStarted>,
    ) -> Consumer<InMemoryTransport> {
        let registry = Arc::new(SubscriptionRegistry::from_config(config));
        let id = HandlerId::new::<OrderStarted>("orders.handler");
        registry.register_for::<OrderStarted>(id.clone()).unwrap();
        let mut handlers = HandlerCatalog::new();
        handlers.add_shared::<OrderStarted, _>(id, handler);

        let connection = ConnectionManager::new(transport.clone(), config);
        let publisher = Publisher::new(connection.clone(), registry.clone(), config);
        Consumer::new(connection, registry, Arc::new(handlers), publisher, config)
    }

    async fn publish(transport: &InMemoryTransport, order_id: u64) {
        let connection = transport.connect().await.unwrap();
        let mut channel = connection.create_channel().await.unwrap();
        let payload = Envelope::new_root(OrderStarted { order_id }, "test", None)
            .unwrap()
            .to_vec()
            .unwrap();
        channel.publish("OrderStarted", payload).await.unwrap();
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawns_workers_per_queue() {
        let transport = InMemoryTransport::new();
        let config = config().with_consumer_parallel_thread_count(3);
        let handle = consumer(&transport, &config, Counter::default()).start();

        assert_eq!(handle.workers(), 3);
        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consumes_and_acks() {
        let transport = InMemoryTransport::new();
        let counter = Counter::default();
        let handle = consumer(&transport, &config(), counter.clone()).start();

        for order_id in 0..5 {
            publish(&transport, order_id).await;
        }
        eventually(|| counter.0.load(Ordering::SeqCst) == 5).await;
        assert_eq!(transport.queue_len("OrderStarted"), 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resumes_after_connection_loss() {
        let transport = InMemoryTransport::new();
        let counter = Counter::default();
        let handle = consumer(&transport, &config(), counter.clone()).start();

        publish(&transport, 1).await;
        eventually(|| counter.0.load(Ordering::SeqCst) == 1).await;

        transport.drop_connections();
        publish(&transport, 2).await;
        eventually(|| counter.0.load(Ordering::SeqCst) >= 2).await;

        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stuck_handler_is_aborted_after_grace_period() {
        let transport = InMemoryTransport::new();
        let started = Arc::new(Notify::new());
        let handle = consumer(&transport, &config(), Blocking(started.clone())).start();

        publish(&transport, 1).await;
        started.notified().await;

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop must not wait past the grace period")
            .unwrap();
    }
}
