use std::sync::Arc;

use crate::HandlerId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(Arc<str>),

    #[error("Handler '{handler}' is already registered for event '{event_name}'")]
    DuplicateRegistration {
        event_name: String,
        handler: HandlerId,
    },

    #[error("No subscription registered for event '{0}'")]
    UnknownEvent(String),

    #[error("Invalid event type: {0}")]
    InvalidType(Arc<str>),

    #[error("Broker connection is unavailable: {0}")]
    ConnectionUnavailable(Arc<str>),

    #[error("Broker connection is not open")]
    NotConnected,

    #[error("The event bus is already started")]
    AlreadyStarted,

    #[error("Publishing '{event_name}' failed after {attempts} attempt(s): {reason}")]
    PublishFailed {
        event_name: String,
        attempts: u32,
        reason: Arc<str>,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error external to relaybus occured: {0}")]
    External(Arc<str>),

    #[error("Worker task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn invalid_argument(reason: impl Into<Arc<str>>) -> Self {
        Error::InvalidArgument(reason.into())
    }

    pub fn invalid_type(reason: impl Into<Arc<str>>) -> Self {
        Error::InvalidType(reason.into())
    }

    /// Wraps a failure raised by application code, typically inside a handler.
    pub fn external(reason: impl std::fmt::Display) -> Self {
        Error::External(reason.to_string().into())
    }

    /// Whether the error is worth another attempt against the broker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionUnavailable(_) | Error::NotConnected | Error::Transport(_)
        )
    }

    /// Whether a delivery that failed with this error may succeed when
    /// delivered again.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, Error::PublishFailed { .. })
    }
}

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    message: Arc<str>,
}

impl TransportError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
