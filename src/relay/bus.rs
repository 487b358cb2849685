//! Publish/subscribe message bus

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::Result;

/// Default per-channel buffer for the in-process bus
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Publish/subscribe transport keyed by channel name
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message, returning how many subscribers received it
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    /// Subscribe to a channel; dropping the subscription unsubscribes
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// A live channel subscription
pub struct Subscription {
    messages: BoxStream<'static, String>,
}

impl Subscription {
    /// Wrap a message stream as a subscription
    ///
    /// The stream should release its bus resources when dropped.
    #[must_use]
    pub fn new(messages: BoxStream<'static, String>) -> Self {
        Self { messages }
    }

    /// Next message, or `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// In-process bus on broadcast channels
///
/// A channel exists while it has at least one subscriber. Publishing to a
/// channel nobody listens on is a no-op.
#[derive(Clone)]
pub struct LocalBus {
    channels: ChannelMap,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` messages per channel
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Number of channels with live subscribers
    #[must_use]
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let sender = lock(&self.channels).get(channel).cloned();
        // No receivers is not an error
        Ok(sender.map_or(0, |s| s.send(message).unwrap_or(0)))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = lock(&self.channels)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let local = LocalReceiver {
            channel: channel.to_string(),
            receiver: Some(receiver),
            channels: Arc::clone(&self.channels),
        };

        let messages = futures::stream::unfold(local, |mut local| async move {
            let message = local.recv().await?;
            Some((message, local))
        });

        Ok(Subscription::new(messages.boxed()))
    }
}

/// Receiver that removes its channel when the last subscriber goes away
struct LocalReceiver {
    channel: String,
    receiver: Option<broadcast::Receiver<String>>,
    channels: ChannelMap,
}

impl LocalReceiver {
    async fn recv(&mut self) -> Option<String> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        channel = %self.channel,
                        skipped,
                        "subscriber lagged, messages dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for LocalReceiver {
    fn drop(&mut self) {
        drop(self.receiver.take());

        let mut channels = lock(&self.channels);
        if channels
            .get(&self.channel)
            .is_some_and(|s| s.receiver_count() == 0)
        {
            channels.remove(&self.channel);
            tracing::trace!(channel = %self.channel, "channel released");
        }
    }
}

fn lock(channels: &ChannelMap) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe("a").await.unwrap();

        assert_eq!(bus.publish("a", "hello".to_string()).await.unwrap(), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = LocalBus::default();
        assert_eq!(bus.publish("nobody", "x".to_string()).await.unwrap(), 0);
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("a").await.unwrap();
        let _b = bus.subscribe("b").await.unwrap();

        bus.publish("b", "for b".to_string()).await.unwrap();
        bus.publish("a", "for a".to_string()).await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("for a"));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = LocalBus::default();
        let first = bus.subscribe("a").await.unwrap();
        let second = bus.subscribe("a").await.unwrap();
        assert_eq!(bus.channel_count(), 1);

        drop(first);
        assert_eq!(bus.channel_count(), 1);

        drop(second);
        assert_eq!(bus.channel_count(), 0);
        assert_eq!(bus.publish("a", "x".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = LocalBus::new(2);
        let mut sub = bus.subscribe("a").await.unwrap();

        for i in 0..5 {
            bus.publish("a", i.to_string()).await.unwrap();
        }

        // Oldest messages were overwritten; the newest survive
        assert_eq!(sub.recv().await.as_deref(), Some("3"));
        assert_eq!(sub.recv().await.as_deref(), Some("4"));
    }
}
