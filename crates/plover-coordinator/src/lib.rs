//! Partition assignment coordination.
//!
//! # Purpose
//! Hands each registering service instance exclusive ownership of one bus
//! partition. A single-process deployment keeps assignments behind a local
//! lock; a clustered deployment keeps them in a shared coordination store
//! guarded by a distributed read/write lock, with one leader-elected instance
//! sweeping assignments whose owners the registry no longer reports live.
use plover_common::unix_now;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod coordination;
pub mod election;
pub mod local;
pub mod memory_store;
pub mod registry;
pub mod rwlock;
pub mod shared;
pub mod sweep;

pub use client::CoordinatorClient;
pub use coordination::{ChildrenWatch, CoordError, CoordOp, CoordinationStore, NodeWatch};
pub use local::LocalAssignments;
pub use memory_store::MemoryCoordinationStore;
pub use registry::{HttpRegistry, ServiceRegistry, StaticRegistry};
pub use shared::SharedAssignments;

/// One service instance's exclusive claim on a topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub service_id: String,
    pub service_name: String,
    pub topic: String,
    pub partition: i32,
    pub assigned_at: i64,
}

impl Assignment {
    pub fn new(service_id: &str, service_name: &str, topic: &str, partition: i32) -> Self {
        Self {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            topic: topic.to_string(),
            partition,
            assigned_at: unix_now(),
        }
    }

    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.assigned_at
    }
}

/// Partition count for a topic, discovered from the bus on first reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub partition_count: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum CoordinatorError {
    #[error("no free partition for topic {0}")]
    Exhausted(String),
    #[error("coordination store error: {0}")]
    Coordination(#[from] CoordError),
    #[error("bus error: {0}")]
    Bus(#[from] plover_bus::BusError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Assignment mutations and reads shared by both deployment modes.
#[async_trait::async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Assign the lowest unoccupied partition of `topic`, or return the
    /// existing index when `service_id` already holds one.
    async fn request_partition(
        &self,
        topic: &str,
        service_name: &str,
        service_id: &str,
    ) -> Result<i32, CoordinatorError>;

    /// Delete the assignment. Unknown ids are ignored.
    async fn release_partition(&self, service_id: &str) -> Result<(), CoordinatorError>;

    async fn get_assignment(
        &self,
        service_id: &str,
    ) -> Result<Option<Assignment>, CoordinatorError>;

    async fn list_service_ids(&self) -> Result<Vec<String>, CoordinatorError>;

    async fn list_service_names(&self) -> Result<Vec<String>, CoordinatorError>;
}
