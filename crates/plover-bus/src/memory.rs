//! In-process partitioned bus over per-partition broadcast channels.
//!
//! Messages fan out FIFO within a partition; subscribers only observe sends
//! that happen after they subscribe, matching a newest-offset start position.
use crate::{Bus, BusError, BusSubscription};
use async_trait::async_trait;
use bytes::Bytes;
use plover_common::ChannelId;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const PARTITION_CAPACITY: usize = 1024;

struct TopicState {
    senders: Vec<broadcast::Sender<Bytes>>,
}

impl TopicState {
    fn new(partitions: usize) -> Self {
        let senders = (0..partitions)
            .map(|_| broadcast::channel(PARTITION_CAPACITY).0)
            .collect();
        Self { senders }
    }
}

pub struct MemoryBus {
    topics: RwLock<HashMap<String, TopicState>>,
    default_partitions: usize,
}

impl MemoryBus {
    pub fn new(default_partitions: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_partitions: default_partitions.max(1),
        }
    }

    /// Pre-create a topic with an explicit partition count.
    pub async fn create_topic(&self, topic: &str, partitions: usize) {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partitions.max(1)));
    }

    async fn sender(
        &self,
        topic: &str,
        partition: ChannelId,
    ) -> Result<broadcast::Sender<Bytes>, BusError> {
        let mut topics = self.topics.write().await;
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.default_partitions));
        let index = partition.as_i32();
        if index < 0 || index as usize >= state.senders.len() {
            return Err(BusError::PartitionOutOfRange {
                topic: topic.to_string(),
                partition: index,
                count: state.senders.len(),
            });
        }
        Ok(state.senders[index as usize].clone())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn partition_count(&self, topic: &str) -> Result<usize, BusError> {
        let mut topics = self.topics.write().await;
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.default_partitions));
        Ok(state.senders.len())
    }

    async fn send(
        &self,
        topic: &str,
        partition: ChannelId,
        payload: Bytes,
    ) -> Result<(), BusError> {
        let sender = self.sender(topic, partition).await?;
        // No live subscriber means the message is dropped, exactly as a
        // newest-offset consumer that has not yet attached would miss it.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: ChannelId,
    ) -> Result<BusSubscription, BusError> {
        let sender = self.sender(topic, partition).await?;
        Ok(BusSubscription::new(sender.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partition_delivery_is_fifo() {
        let bus = MemoryBus::new(2);
        let mut sub = bus.subscribe("relay", ChannelId(0)).await.expect("sub");

        for index in 0..5u8 {
            bus.send("relay", ChannelId(0), Bytes::from(vec![index]))
                .await
                .expect("send");
        }
        for index in 0..5u8 {
            assert_eq!(sub.recv().await, Some(Bytes::from(vec![index])));
        }
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let bus = MemoryBus::new(2);
        let mut zero = bus.subscribe("relay", ChannelId(0)).await.expect("sub");
        let mut one = bus.subscribe("relay", ChannelId(1)).await.expect("sub");

        bus.send("relay", ChannelId(1), Bytes::from_static(b"only-one"))
            .await
            .expect("send");

        assert_eq!(one.recv().await, Some(Bytes::from_static(b"only-one")));
        // Partition 0 saw nothing; the next frame it receives is its own.
        bus.send("relay", ChannelId(0), Bytes::from_static(b"only-zero"))
            .await
            .expect("send");
        assert_eq!(zero.recv().await, Some(Bytes::from_static(b"only-zero")));
    }

    #[tokio::test]
    async fn newest_offset_drops_earlier_sends() {
        let bus = MemoryBus::new(1);
        bus.send("relay", ChannelId(0), Bytes::from_static(b"early"))
            .await
            .expect("send");

        let mut sub = bus.subscribe("relay", ChannelId(0)).await.expect("sub");
        bus.send("relay", ChannelId(0), Bytes::from_static(b"late"))
            .await
            .expect("send");
        assert_eq!(sub.recv().await, Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn out_of_range_partition_is_rejected() {
        let bus = MemoryBus::new(2);
        let err = bus
            .send("relay", ChannelId(9), Bytes::new())
            .await
            .expect_err("range");
        assert!(matches!(err, BusError::PartitionOutOfRange { .. }));
    }

    #[tokio::test]
    async fn topic_discovery_uses_default_partition_count() {
        let bus = MemoryBus::new(4);
        assert_eq!(bus.partition_count("fresh").await.expect("count"), 4);
    }

    #[tokio::test]
    async fn keyed_send_lands_on_one_partition() {
        let bus = MemoryBus::new(4);
        bus.create_topic("relay", 4).await;
        let mut subs = Vec::new();
        for index in 0..4 {
            subs.push(bus.subscribe("relay", ChannelId(index)).await.expect("sub"));
        }
        bus.send_keyed("relay", "user-1", Bytes::from_static(b"keyed"))
            .await
            .expect("send");

        let mut seen = 0;
        for sub in &mut subs {
            if let Ok(Some(payload)) =
                tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
            {
                assert_eq!(payload, Bytes::from_static(b"keyed"));
                seen += 1;
            }
        }
        assert_eq!(seen, 1);
    }
}
