use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RetryPolicy, retry_policy::millis};

/// Runtime configuration of the bus.
///
/// Use [`Default`] for sensible values and the `with_*` methods to customize.
/// The struct also deserializes (missing fields take their defaults), so it can
/// be loaded from whatever configuration source the application uses.
///
/// # Examples
///
/// ```rust
/// use relaybus::Config;
///
/// let config = Config::default()
///     .with_client_name("orders")
///     .with_consumer_parallel_thread_count(4)
///     .with_max_requeue_count(2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this service on the broker, stamped as `producer` on every
    /// envelope it publishes.
    /// Default: "relaybus"
    pub client_name: String,

    /// Prefix stripped from type names when deriving event names.
    /// Default: ""
    pub event_name_prefix: String,

    /// Suffixes stripped from type names when deriving event names.
    /// Default: ["IntegrationEvent", "Eto"]
    pub event_name_suffixes: Vec<String>,

    /// Attempts made to connect to the broker, and to send one message,
    /// before giving up.
    /// Default: 5
    pub connection_retry_count: u32,

    /// Delays between those attempts.
    pub retry_policy: RetryPolicy,

    /// Maximum number of unacknowledged deliveries per consumer worker.
    /// Default: 10
    pub consumer_max_fetch_count: u16,

    /// Number of workers consuming each subscribed queue.
    /// Default: 1
    pub consumer_parallel_thread_count: usize,

    /// How many times a failed delivery is replayed by the recovery flow.
    /// Default: 1
    pub max_requeue_count: u32,

    /// Time granted to in-flight handlers when the consumers shut down.
    /// Default: 5 s
    #[serde(with = "millis")]
    pub shutdown_grace_period: Duration,

    /// Whether [`EventBus::start`](crate::EventBus::start) subscribes the
    /// requeue handler to [`BrokerErrorEvent`](crate::BrokerErrorEvent).
    /// Default: true
    pub enable_recovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_name: "relaybus".into(),
            event_name_prefix: String::new(),
            event_name_suffixes: vec!["IntegrationEvent".into(), "Eto".into()],
            connection_retry_count: 5,
            retry_policy: RetryPolicy::default(),
            consumer_max_fetch_count: 10,
            consumer_parallel_thread_count: 1,
            max_requeue_count: 1,
            shutdown_grace_period: Duration::from_secs(5),
            enable_recovery: true,
        }
    }
}

impl Config {
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_event_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_name_prefix = prefix.into();
        self
    }

    pub fn with_event_name_suffixes<S: Into<String>>(
        mut self,
        suffixes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.event_name_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the number of connection and send attempts. Zero is treated as one.
    pub fn with_connection_retry_count(mut self, count: u32) -> Self {
        self.connection_retry_count = count;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bound the deliveries a worker holds without acknowledging them.
    ///
    /// This is the backpressure applied against the broker: a worker stops
    /// receiving until it has acknowledged earlier messages.
    pub fn with_consumer_max_fetch_count(mut self, count: u16) -> Self {
        self.consumer_max_fetch_count = count;
        self
    }

    /// Set how many workers consume each queue.
    ///
    /// With more than one worker, messages of the same queue are handled
    /// concurrently and no global order is kept.
    pub fn with_consumer_parallel_thread_count(mut self, count: usize) -> Self {
        self.consumer_parallel_thread_count = count;
        self
    }

    pub fn with_max_requeue_count(mut self, count: u32) -> Self {
        self.max_requeue_count = count;
        self
    }

    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.enable_recovery = enabled;
        self
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.connection_retry_count.max(1)
    }

    pub(crate) fn workers_per_queue(&self) -> usize {
        self.consumer_parallel_thread_count.max(1)
    }

    pub(crate) fn prefetch(&self) -> u16 {
        self.consumer_max_fetch_count.max(1)
    }
}
