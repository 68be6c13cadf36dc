use std::{
    fmt,
    sync::{Arc, Weak},
};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    Config, Error, Result, RetryPolicy,
    transport::{ChannelOf, Connection, Transport},
};

/// Lifecycle of the broker connection.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Faulted -> Connecting -> ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection was lost and a background reconnect is under way.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Faulted => write!(f, "Faulted"),
        }
    }
}

struct Slot<C> {
    connection: Option<Arc<C>>,
    generation: u64,
}

/// Owns the single broker connection of the process.
///
/// - `ensure_connected()` connects with bounded exponential backoff.
/// - `open_channel()` vends a channel on the live connection.
///
/// When the transport reports a lost connection, the manager moves to
/// [`ConnectionState::Faulted`] and reconnects in the background. Callers
/// arriving meanwhile fail fast with [`Error::ConnectionUnavailable`] instead of
/// queueing up behind the reconnect.
///
/// Only connection establishment and channel creation are serialized. Channels
/// are independent once handed out.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    attempts: u32,
    policy: RetryPolicy,
    slot: Mutex<Slot<T::Connection>>,
    state: watch::Sender<ConnectionState>,
    closed: CancellationToken,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            transport,
            attempts: config.attempts(),
            policy: config.retry_policy,
            slot: Mutex::new(Slot {
                connection: None,
                generation: 0,
            }),
            state: watch::Sender::new(ConnectionState::Disconnected),
            closed: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether a lost connection is being re-established in the background.
    pub fn is_reconnecting(&self) -> bool {
        matches!(self.state(), ConnectionState::Faulted | ConnectionState::Connecting)
            && !self.closed.is_cancelled()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Make sure a live connection exists.
    ///
    /// Does nothing when already connected. While a background reconnect is
    /// running this fails immediately with [`Error::ConnectionUnavailable`].
    /// Otherwise up to `connection_retry_count` attempts are made; if all of
    /// them fail the manager stays `Disconnected`.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionUnavailable("connection manager is closed".into()));
        }
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Faulted => return Err(reconnecting()),
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }

        let mut slot = self.slot.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Faulted | ConnectionState::Connecting => return Err(reconnecting()),
            ConnectionState::Disconnected => {}
        }

        self.set_state(ConnectionState::Connecting);
        match self.connect_with_retry().await {
            Ok(connection) => {
                self.install(&mut slot, connection);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Create a channel on the live connection.
    ///
    /// Fails with [`Error::NotConnected`] unless the manager is `Connected`;
    /// call [`ensure_connected`](Self::ensure_connected) first.
    pub async fn open_channel(&self) -> Result<ChannelOf<T>> {
        let slot = self.slot.lock().await;
        let connection = match (&slot.connection, self.state()) {
            (Some(connection), ConnectionState::Connected) if connection.is_open() => connection,
            _ => return Err(Error::NotConnected),
        };
        Ok(connection.create_channel().await?)
    }

    /// Close the connection for good. Later calls to `ensure_connected` fail.
    pub async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let mut slot = self.slot.lock().await;
        slot.generation += 1;
        let connection = slot.connection.take();
        self.set_state(ConnectionState::Disconnected);
        if let Some(connection) = connection {
            connection.close().await?;
            tracing::info!("broker connection closed");
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "broker connection state changed");
        }
    }

    async fn connect_with_retry(&self) -> Result<T::Connection> {
        let mut last_error = None;
        for attempt in 0..self.attempts {
            if attempt > 0 {
                let delay = self.policy.delay(attempt - 1);
                tokio::select! {
                    _ = self.closed.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.transport.connect().await {
                Ok(connection) => {
                    tracing::info!(attempt = attempt + 1, "broker connection established");
                    return Ok(connection);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        error = %e,
                        "broker connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(Error::ConnectionUnavailable(
            match last_error {
                Some(e) => format!("gave up after {} attempt(s): {e}", self.attempts),
                None => "connection manager is closed".to_string(),
            }
            .into(),
        ))
    }

    fn install(self: &Arc<Self>, slot: &mut Slot<T::Connection>, connection: T::Connection) {
        slot.generation += 1;
        let generation = slot.generation;
        let signal = connection.close_signal();
        slot.connection = Some(Arc::new(connection));
        self.set_state(ConnectionState::Connected);

        let manager = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = signal.cancelled() => Self::on_connection_lost(manager, generation).await,
            }
        });
    }

    async fn on_connection_lost(manager: Weak<Self>, generation: u64) {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        {
            let mut slot = manager.slot.lock().await;
            if slot.generation != generation || manager.closed.is_cancelled() {
                return;
            }
            slot.connection = None;
            manager.set_state(ConnectionState::Faulted);
        }
        tracing::warn!("broker connection lost, reconnecting in background");
        tokio::spawn(async move { manager.reconnect().await });
    }

    async fn reconnect(self: Arc<Self>) {
        for attempt in 0..self.attempts {
            let delay = self.policy.delay(attempt);
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut slot = self.slot.lock().await;
            if self.closed.is_cancelled() || self.state() != ConnectionState::Faulted {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            match self.transport.connect().await {
                Ok(connection) => {
                    tracing::info!(attempt = attempt + 1, "broker connection re-established");
                    self.install(&mut slot, connection);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        error = %e,
                        "broker reconnect attempt failed"
                    );
                    self.set_state(ConnectionState::Faulted);
                }
            }
        }
        tracing::error!(
            attempts = self.attempts,
            "giving up on background reconnect, next use will retry"
        );
        self.set_state(ConnectionState::Disconnected);
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn reconnecting() -> Error {
    Error::ConnectionUnavailable("broker connection is being re-established".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTransport;
    use crate::transport::Channel;
    use std::time::Duration;

    fn config(retries: u32) -> Config {
        Config::default()
            .with_connection_retry_count(retries)
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1)))
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

    #[tokio::test]
    async fn test_connects_after_transient_failures() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connects(2);
        let manager = ConnectionManager::new(transport.clone(), &config(3));

        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_attempts(), 3);

        manager.ensure_connected().await.unwrap();
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_count() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connects(10);
        let manager = ConnectionManager::new(transport.clone(), &config(3));

        let err = manager.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_open_channel_requires_connection() {
        let transport = InMemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone(), &config(1));
        assert!(matches!(manager.open_channel().await, Err(Error::NotConnected)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_attempts(), 0);

        manager.ensure_connected().await.unwrap();
        let mut channel = manager.open_channel().await.unwrap();
        channel.publish("q", b"{}".to_vec()).await.unwrap();
        assert_eq!(transport.published_count("q"), 1);

        manager.close().await.unwrap();
        assert!(matches!(manager.open_channel().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconnects_in_background_after_loss() {
        let transport = InMemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone(), &config(3));
        manager.ensure_connected().await.unwrap();

        transport.drop_connections();
        eventually(|| {
            transport.connect_attempts() == 2 && manager.state() == ConnectionState::Connected
        })
        .await;
        assert_eq!(transport.open_connections(), 1);
        assert!(manager.open_channel().await.is_ok());
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_fails_fast_while_faulted() {
        let transport = InMemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone(), &config(2));
        manager.ensure_connected().await.unwrap();

        transport.fail_next_connects(100);
        transport.drop_connections();
        eventually(|| manager.state() != ConnectionState::Connected).await;
        assert!(matches!(
            manager.ensure_connected().await,
            Err(Error::ConnectionUnavailable(_))
        ));

        eventually(|| manager.state() == ConnectionState::Disconnected).await;
        transport.fail_next_connects(0);
        manager.ensure_connected().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let transport = InMemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone(), &config(1));
        manager.ensure_connected().await.unwrap();

        manager.close().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_connections(), 0);
        assert!(manager.ensure_connected().await.is_err());
    }
}
