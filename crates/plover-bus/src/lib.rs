//! Abstract message bus: send to a partition, consume from a partition.
//!
//! # Purpose
//! The routing plane talks to this trait only. Two broker shapes satisfy it:
//! a partitioned append log where consumers subscribe to an explicit
//! `(topic, partition)` starting at the newest offset, and a key-sharded
//! topic where the channel id doubles as a string routing key. The routing
//! logic above is identical either way, so the key-shared form is expressed
//! as a default method over the partitioned one.
use async_trait::async_trait;
use bytes::Bytes;
use plover_common::ChannelId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::broadcast;

pub mod consumer;
pub mod memory;

pub use consumer::{deliver, run_consumer, DELIVERY_TIMEOUT};
pub use memory::MemoryBus;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("partition {partition} out of range for topic {topic} ({count} partitions)")]
    PartitionOutOfRange {
        topic: String,
        partition: i32,
        count: usize,
    },
    #[error("bus send failed: {0}")]
    Send(String),
}

/// Live subscription to one partition, starting at the newest offset.
pub struct BusSubscription {
    receiver: broadcast::Receiver<Bytes>,
}

impl BusSubscription {
    pub fn new(receiver: broadcast::Receiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once the partition is gone. A lagged consumer
    /// skips ahead rather than terminating.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Partition count for a topic, discovering the topic on first reference.
    async fn partition_count(&self, topic: &str) -> Result<usize, BusError>;

    async fn send(
        &self,
        topic: &str,
        partition: ChannelId,
        payload: Bytes,
    ) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        topic: &str,
        partition: ChannelId,
    ) -> Result<BusSubscription, BusError>;

    /// Key-sharded variant: route by string key instead of explicit partition.
    async fn send_keyed(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError> {
        let count = self.partition_count(topic).await?;
        let partition = ChannelId(partition_for_key(key, count));
        self.send(topic, partition, payload).await
    }
}

fn partition_for_key(key: &str, count: usize) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count.max(1) as u64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_routing_is_stable_and_in_range() {
        let first = partition_for_key("channel-7", 8);
        let second = partition_for_key("channel-7", 8);
        assert_eq!(first, second);
        assert!((0..8).contains(&first));
    }

    #[test]
    fn key_routing_tolerates_single_partition() {
        assert_eq!(partition_for_key("anything", 1), 0);
    }
}
