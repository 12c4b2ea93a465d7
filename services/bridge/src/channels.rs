//! Keyed in-memory delivery channels.
//!
//! One bounded channel per link code (publish-stream waiters) or per user id
//! (message streams). Exactly one consumer owns each receiver, the stream
//! writer; producers resolve the sender through this map. Removing a key
//! drops the sender, which ends the consumer's stream.
use dashmap::DashMap;
use tokio::sync::mpsc;

pub struct ChannelMap<T> {
    channels: DashMap<String, mpsc::Sender<T>>,
}

impl<T: Send + 'static> ChannelMap<T> {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Create the channel for `key`, handing back the consuming half. An
    /// existing channel under the same key is replaced.
    pub fn add(&self, key: &str) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(1);
        self.channels.insert(key.to_string(), sender);
        receiver
    }

    pub fn get(&self, key: &str) -> Option<mpsc::Sender<T>> {
        self.channels.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.channels.remove(key);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver one value to the channel for `key`, giving the consumer the
    /// standard delivery window to drain. Returns false when there is no
    /// channel, it is closed, or the window elapses.
    pub async fn deliver(&self, key: &str, value: T) -> bool {
        let Some(sender) = self.get(key) else {
            return false;
        };
        match tokio::time::timeout(plover_bus::DELIVERY_TIMEOUT, sender.send(value)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::debug!(key, "delivery channel closed");
                false
            }
            Err(_) => {
                tracing::warn!(key, "delivery timeout, dropping message");
                false
            }
        }
    }
}

impl<T: Send + 'static> Default for ChannelMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_deliver_receive_round_trip() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let mut receiver = map.add("key");
        assert!(map.deliver("key", 7).await);
        assert_eq!(receiver.recv().await, Some(7));
    }

    #[tokio::test]
    async fn deliver_without_channel_fails() {
        let map: ChannelMap<u32> = ChannelMap::new();
        assert!(!map.deliver("ghost", 1).await);
    }

    #[tokio::test]
    async fn remove_ends_the_consumer_stream() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let mut receiver = map.add("key");
        map.remove("key");
        assert_eq!(receiver.recv().await, None);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn replacing_a_key_closes_the_old_receiver() {
        let map: ChannelMap<u32> = ChannelMap::new();
        let mut old = map.add("key");
        let mut new = map.add("key");
        assert_eq!(old.recv().await, None);
        assert!(map.deliver("key", 9).await);
        assert_eq!(new.recv().await, Some(9));
    }
}
