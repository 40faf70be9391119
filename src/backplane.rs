//! Cross-process invalidation pub/sub.
//!
//! The backplane lets one process's invalidation (a key removed, a tag
//! invalidated, a full clear) become visible to every other process
//! sharing the same L2/L3 tiers. Delivery is best-effort and
//! at-least-once: a subscriber may see the same message more than once,
//! and there is no ordering guarantee across different keys or tags.
//! Messages carrying this process's own `instance_id` are discarded by
//! receivers to avoid invalidation echo.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{CacheError, CacheResult};

/// What an invalidation envelope describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Invalidate a single key.
    Key,
    /// Invalidate every key associated with a tag.
    Tag,
    /// Invalidate everything.
    ClearAll,
}

/// A tagged invalidation envelope published to and received from the
/// backplane. `payload` is the key or tag string; empty for `ClearAll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneMessage {
    /// What kind of invalidation this message carries.
    pub kind: MessageKind,
    /// The key or tag string this message invalidates; empty for
    /// `ClearAll`.
    pub payload: String,
    /// Identifies the process that published this message, so
    /// receivers can discard their own echoes.
    pub instance_id: String,
    /// Wall-clock milliseconds at publish time.
    pub timestamp_millis: u64,
}

impl BackplaneMessage {
    fn now_millis() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Build a key-invalidation message.
    pub fn key(instance_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Key,
            payload: key.into(),
            instance_id: instance_id.into(),
            timestamp_millis: Self::now_millis(),
        }
    }

    /// Build a tag-invalidation message.
    pub fn tag(instance_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Tag,
            payload: tag.into(),
            instance_id: instance_id.into(),
            timestamp_millis: Self::now_millis(),
        }
    }

    /// Build a clear-all message.
    pub fn clear_all(instance_id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::ClearAll,
            payload: String::new(),
            instance_id: instance_id.into(),
            timestamp_millis: Self::now_millis(),
        }
    }
}

/// A handle to an active backplane subscription. Dropping it is
/// equivalent to calling `unsubscribe`.
pub struct Subscription {
    receiver: broadcast::Receiver<BackplaneMessage>,
}

impl Subscription {
    /// Await the next message not yet seen by this subscription. Skips
    /// over `Lagged` gaps (best-effort delivery permits missed
    /// messages) rather than treating them as fatal.
    pub async fn recv(&mut self) -> Option<BackplaneMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The contract every backplane implementation satisfies: publish three
/// kinds of invalidation, and let callers subscribe to receive them.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish a key invalidation.
    async fn publish_key(&self, key: &str) -> CacheResult<()>;

    /// Publish a tag invalidation.
    async fn publish_tag(&self, tag: &str) -> CacheResult<()>;

    /// Publish a clear-all.
    async fn publish_clear_all(&self) -> CacheResult<()>;

    /// Subscribe to incoming messages, including this process's own
    /// publishes (receivers are expected to filter by `instance_id`).
    fn subscribe(&self) -> Subscription;
}

/// An in-process backplane backed by `tokio::sync::broadcast`. Useful
/// for single-process deployments and as the default when no external
/// pub/sub (Redis, NATS, etc.) is configured; real multi-process
/// deployments plug in a provider-backed implementation of
/// [`Backplane`] instead.
pub struct InProcessBackplane {
    instance_id: String,
    tx: broadcast::Sender<BackplaneMessage>,
}

impl InProcessBackplane {
    /// Construct a backplane publishing under `instance_id`, with a
    /// channel buffering up to `capacity` undelivered messages per
    /// subscriber before it starts dropping the oldest.
    pub fn new(instance_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            instance_id: instance_id.into(),
            tx,
        }
    }

    fn publish(&self, message: BackplaneMessage) -> CacheResult<()> {
        // No active subscribers is not an error: a freshly started
        // process with no peers yet should not fail a local invalidation.
        let _ = self.tx.send(message);
        Ok(())
    }
}

#[async_trait]
impl Backplane for InProcessBackplane {
    async fn publish_key(&self, key: &str) -> CacheResult<()> {
        self.publish(BackplaneMessage::key(self.instance_id.clone(), key))
    }

    async fn publish_tag(&self, tag: &str) -> CacheResult<()> {
        self.publish(BackplaneMessage::tag(self.instance_id.clone(), tag))
    }

    async fn publish_clear_all(&self) -> CacheResult<()> {
        self.publish(BackplaneMessage::clear_all(self.instance_id.clone()))
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.tx.subscribe(),
        }
    }
}

/// True if `message` originated from this process and should therefore
/// be discarded to avoid invalidation echo.
pub fn is_self_originated(message: &BackplaneMessage, local_instance_id: &str) -> bool {
    message.instance_id == local_instance_id
}

impl From<broadcast::error::SendError<BackplaneMessage>> for CacheError {
    fn from(error: broadcast::error::SendError<BackplaneMessage>) -> Self {
        CacheError::Backplane(error.to_string())
    }
}
