use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery metadata attached to every envelope.
///
/// - `message_id`: unique identifier of this envelope, minted at publish time.
/// - `parent_message_id`: the envelope whose handler published this one.
/// - `hop_level`: number of causal publish steps since the root event.
/// - `is_requeued` / `requeue_count`: set when this delivery replays a failed one.
/// - `correlation_id`: shared by every envelope of a causal chain.
/// - `user_id`, `role`, `channel`: provenance copied forward along the chain.
/// - `producer`: name of the service that published the envelope.
/// - `message_time`: time of this specific publish.
///
/// `hop_level` and `requeue_count` give a logical ordering of a chain; use them
/// to spot runaway propagation loops rather than relying on wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub(crate) message_id: Uuid,
    #[serde(default)]
    pub(crate) parent_message_id: Option<Uuid>,
    #[serde(default)]
    pub(crate) hop_level: u32,
    #[serde(default)]
    pub(crate) is_requeued: bool,
    #[serde(default)]
    pub(crate) requeue_count: u32,
    pub(crate) correlation_id: String,
    #[serde(default)]
    pub(crate) user_id: Option<String>,
    #[serde(default)]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) channel: Option<String>,
    pub(crate) producer: String,
    pub(crate) message_time: DateTime<Utc>,
}

impl Meta {
    pub(crate) fn root(producer: String, correlation_id: Option<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            parent_message_id: None,
            hop_level: 0,
            is_requeued: false,
            requeue_count: 0,
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: None,
            role: None,
            channel: None,
            producer,
            message_time: Utc::now(),
        }
    }

    /// Metadata for an envelope caused by the one described by `self`.
    pub(crate) fn child(&self) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            parent_message_id: Some(self.message_id),
            hop_level: self.hop_level.saturating_add(1),
            is_requeued: false,
            requeue_count: 0,
            correlation_id: self.correlation_id.clone(),
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            channel: self.channel.clone(),
            producer: self.producer.clone(),
            message_time: Utc::now(),
        }
    }

    /// Metadata for a replay of the delivery described by `self`.
    pub(crate) fn replay(&self) -> Self {
        Self {
            is_requeued: true,
            requeue_count: self.requeue_count.saturating_add(1),
            ..self.child()
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn parent_message_id(&self) -> Option<Uuid> {
        self.parent_message_id
    }

    pub fn hop_level(&self) -> u32 {
        self.hop_level
    }

    pub fn is_requeued(&self) -> bool {
        self.is_requeued
    }

    pub fn requeue_count(&self) -> u32 {
        self.requeue_count
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Name of the service that published the envelope.
    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn message_time(&self) -> DateTime<Utc> {
        self.message_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_defaults() {
        let meta = Meta::root("orders".into(), None);
        assert_eq!(meta.hop_level(), 0);
        assert_eq!(meta.requeue_count(), 0);
        assert!(!meta.is_requeued());
        assert!(meta.parent_message_id().is_none());
        assert!(Uuid::parse_str(meta.correlation_id()).is_ok());
    }

    #[test]
    fn test_replay_increments_counters() {
        let mut failed = Meta::root("orders".into(), Some("corr-1".into()));
        failed.requeue_count = 2;
        failed.hop_level = 3;

        let replay = failed.replay();
        assert!(replay.is_requeued());
        assert_eq!(replay.requeue_count(), 3);
        assert_eq!(replay.hop_level(), 4);
        assert_eq!(replay.parent_message_id(), Some(failed.message_id()));
        assert_eq!(replay.correlation_id(), "corr-1");
    }
}
