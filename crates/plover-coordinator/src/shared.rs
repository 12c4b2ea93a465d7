//! Clustered assignment store over a shared coordination store.
//!
//! # Purpose
//! Persists each assignment as three coordinated records (partition slot,
//! service-name child, flat service-id index) written in one atomic multi-op,
//! all mutations under the distributed writer lock and reads under the reader
//! lock. Releasing also prunes topic and service-name parents left empty.
//!
//! Layout under the base path:
//!
//! ```text
//! <base>/topics/<topic>                 topic meta {partition_count}
//! <base>/topics/<topic>/<partition>     assignment record
//! <base>/services/<name>/<service_id>   assignment record
//! <base>/serviceIds/<service_id>        assignment record
//! <base>/lock/{read-,write-}NNNNNNNNNN  lock nodes
//! ```
use crate::coordination::{CoordError, CoordOp, CoordinationStore};
use crate::rwlock::DistributedRwLock;
use crate::{Assignment, AssignmentStore, CoordinatorError, TopicMeta};
use plover_bus::Bus;
use std::sync::Arc;

pub const DEFAULT_BASE_PATH: &str = "/plover";

pub struct SharedAssignments {
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn Bus>,
    base: String,
    lock: DistributedRwLock,
}

impl SharedAssignments {
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        bus: Arc<dyn Bus>,
        base: &str,
    ) -> Result<Self, CoordinatorError> {
        for suffix in ["topics", "services", "serviceIds", "lock"] {
            store.ensure_path(&format!("{base}/{suffix}")).await?;
        }
        let session = store.create_session().await?;
        let lock = DistributedRwLock::new(store.clone(), &format!("{base}/lock"), session);
        Ok(Self {
            store,
            bus,
            base: base.to_string(),
            lock,
        })
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("{}/topics/{topic}", self.base)
    }

    fn service_name_path(&self, name: &str) -> String {
        format!("{}/services/{name}", self.base)
    }

    fn service_id_path(&self, service_id: &str) -> String {
        format!("{}/serviceIds/{service_id}", self.base)
    }

    async fn read_assignment(
        &self,
        service_id: &str,
    ) -> Result<Option<Assignment>, CoordinatorError> {
        match self.store.get(&self.service_id_path(service_id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Topic partition count, asking the bus and recording the topic node on
    /// first reference.
    async fn topic_partition_count(&self, topic: &str) -> Result<usize, CoordinatorError> {
        let path = self.topic_path(topic);
        if let Some(data) = self.store.get(&path).await? {
            let meta: TopicMeta = serde_json::from_slice(&data)?;
            return Ok(meta.partition_count);
        }

        let partition_count = self.bus.partition_count(topic).await?;
        let meta = TopicMeta { partition_count };
        self.store.create(&path, serde_json::to_vec(&meta)?).await?;
        tracing::info!(topic, partition_count, "topic recorded");
        Ok(partition_count)
    }

    async fn request_locked(
        &self,
        topic: &str,
        service_name: &str,
        service_id: &str,
    ) -> Result<i32, CoordinatorError> {
        if let Some(existing) = self.read_assignment(service_id).await? {
            tracing::debug!(service_id, partition = existing.partition, "already assigned");
            return Ok(existing.partition);
        }

        let count = self.topic_partition_count(topic).await?;
        let occupied = self.store.children(&self.topic_path(topic)).await?;

        let free = (0..count as i32)
            .find(|index| !occupied.iter().any(|name| name == &index.to_string()))
            .ok_or_else(|| CoordinatorError::Exhausted(topic.to_string()))?;

        self.store
            .ensure_path(&self.service_name_path(service_name))
            .await?;

        let assignment = Assignment::new(service_id, service_name, topic, free);
        let data = serde_json::to_vec(&assignment)?;
        self.store
            .multi(vec![
                CoordOp::Create {
                    path: format!("{}/{free}", self.topic_path(topic)),
                    data: data.clone(),
                },
                CoordOp::Create {
                    path: format!("{}/{service_id}", self.service_name_path(service_name)),
                    data: data.clone(),
                },
                CoordOp::Create {
                    path: self.service_id_path(service_id),
                    data,
                },
            ])
            .await?;

        tracing::info!(service_id, topic, partition = free, "partition assigned");
        Ok(free)
    }

    async fn release_locked(&self, service_id: &str) -> Result<(), CoordinatorError> {
        let Some(assignment) = self.read_assignment(service_id).await? else {
            return Ok(());
        };

        self.store
            .multi(vec![
                CoordOp::Delete {
                    path: format!(
                        "{}/{}",
                        self.topic_path(&assignment.topic),
                        assignment.partition
                    ),
                },
                CoordOp::Delete {
                    path: format!(
                        "{}/{service_id}",
                        self.service_name_path(&assignment.service_name)
                    ),
                },
                CoordOp::Delete {
                    path: self.service_id_path(service_id),
                },
            ])
            .await?;

        self.prune_if_empty(&self.topic_path(&assignment.topic)).await;
        self.prune_if_empty(&self.service_name_path(&assignment.service_name))
            .await;

        tracing::info!(service_id, topic = %assignment.topic, "partition released");
        Ok(())
    }

    async fn prune_if_empty(&self, path: &str) {
        match self.store.children(path).await {
            Ok(children) if children.is_empty() => {
                if let Err(err) = self.store.delete(path).await {
                    tracing::debug!(%path, error = %err, "empty-parent prune skipped");
                }
            }
            Ok(_) => {}
            Err(CoordError::NotFound(_)) => {}
            Err(err) => tracing::warn!(%path, error = %err, "empty-parent check failed"),
        }
    }
}

#[async_trait::async_trait]
impl AssignmentStore for SharedAssignments {
    async fn request_partition(
        &self,
        topic: &str,
        service_name: &str,
        service_id: &str,
    ) -> Result<i32, CoordinatorError> {
        let guard = self.lock.write().await?;
        let result = self.request_locked(topic, service_name, service_id).await;
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "write lock release failed");
        }
        result
    }

    async fn release_partition(&self, service_id: &str) -> Result<(), CoordinatorError> {
        let guard = self.lock.write().await?;
        let result = self.release_locked(service_id).await;
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "write lock release failed");
        }
        result
    }

    async fn get_assignment(
        &self,
        service_id: &str,
    ) -> Result<Option<Assignment>, CoordinatorError> {
        let guard = self.lock.read().await?;
        let result = self.read_assignment(service_id).await;
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "read lock release failed");
        }
        result
    }

    async fn list_service_ids(&self) -> Result<Vec<String>, CoordinatorError> {
        let guard = self.lock.read().await?;
        let result = self
            .store
            .children(&format!("{}/serviceIds", self.base))
            .await
            .map_err(CoordinatorError::from);
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "read lock release failed");
        }
        result
    }

    async fn list_service_names(&self) -> Result<Vec<String>, CoordinatorError> {
        let guard = self.lock.read().await?;
        let result = self
            .store
            .children(&format!("{}/services", self.base))
            .await
            .map_err(CoordinatorError::from);
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "read lock release failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryCoordinationStore;
    use plover_bus::MemoryBus;

    async fn shared(partitions: usize) -> SharedAssignments {
        let store = Arc::new(MemoryCoordinationStore::new());
        let bus = Arc::new(MemoryBus::new(partitions));
        SharedAssignments::new(store, bus, DEFAULT_BASE_PATH)
            .await
            .expect("shared store")
    }

    #[tokio::test]
    async fn assigns_and_reads_back() {
        let store = shared(2).await;
        let partition = store
            .request_partition("relay", "bridge", "b-1")
            .await
            .expect("req");
        assert_eq!(partition, 0);

        let assignment = store
            .get_assignment("b-1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(assignment.topic, "relay");
        assert_eq!(assignment.partition, 0);
        assert_eq!(store.list_service_ids().await.expect("ids"), vec!["b-1"]);
        assert_eq!(
            store.list_service_names().await.expect("names"),
            vec!["bridge"]
        );
    }

    #[tokio::test]
    async fn rerequest_returns_existing_index() {
        let store = shared(2).await;
        let first = store
            .request_partition("relay", "bridge", "b-1")
            .await
            .expect("req");
        let second = store
            .request_partition("relay", "bridge", "b-1")
            .await
            .expect("req");
        assert_eq!(first, second);
        assert_eq!(store.list_service_ids().await.expect("ids").len(), 1);
    }

    #[tokio::test]
    async fn fills_lowest_hole_after_release() {
        let store = shared(3).await;
        store.request_partition("relay", "bridge", "b-1").await.expect("req");
        store.request_partition("relay", "bridge", "b-2").await.expect("req");
        store.request_partition("relay", "bridge", "b-3").await.expect("req");

        store.release_partition("b-2").await.expect("release");
        let partition = store
            .request_partition("relay", "bridge", "b-4")
            .await
            .expect("req");
        assert_eq!(partition, 1);
    }

    #[tokio::test]
    async fn exhausted_leaves_no_record() {
        let store = shared(1).await;
        store.request_partition("relay", "bridge", "b-1").await.expect("req");
        let err = store
            .request_partition("relay", "bridge", "b-2")
            .await
            .expect_err("full");
        assert!(matches!(err, CoordinatorError::Exhausted(_)));
        assert_eq!(store.get_assignment("b-2").await.expect("get"), None);
    }

    #[tokio::test]
    async fn release_prunes_empty_parents() {
        let store = shared(2).await;
        store.request_partition("relay", "bridge", "b-1").await.expect("req");
        store.release_partition("b-1").await.expect("release");

        // Topic and service-name parents are gone along with the assignment.
        let topics = store
            .store
            .children(&format!("{DEFAULT_BASE_PATH}/topics"))
            .await
            .expect("children");
        assert!(topics.is_empty());
        let names = store.list_service_names().await.expect("names");
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn release_unknown_is_ignored() {
        let store = shared(1).await;
        store.release_partition("ghost").await.expect("release");
    }

    #[tokio::test]
    async fn partition_exclusivity_across_concurrent_requests() {
        let store = Arc::new(shared(4).await);
        let mut handles = Vec::new();
        for index in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .request_partition("relay", "bridge", &format!("b-{index}"))
                    .await
                    .expect("req")
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let partition = handle.await.expect("join");
            // Each service must land on a distinct partition.
            assert!(seen.insert(partition));
        }
    }
}
