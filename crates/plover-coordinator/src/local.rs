//! Single-process assignment store guarded by a local lock.
use crate::{Assignment, AssignmentStore, CoordinatorError};
use plover_bus::Bus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct LocalState {
    // Cached partition counts, filled from the bus on first reference.
    topics: HashMap<String, usize>,
    by_service: HashMap<String, Assignment>,
    by_slot: HashMap<(String, i32), String>,
}

pub struct LocalAssignments {
    bus: Arc<dyn Bus>,
    state: RwLock<LocalState>,
}

impl LocalAssignments {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            state: RwLock::new(LocalState {
                topics: HashMap::new(),
                by_service: HashMap::new(),
                by_slot: HashMap::new(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl AssignmentStore for LocalAssignments {
    async fn request_partition(
        &self,
        topic: &str,
        service_name: &str,
        service_id: &str,
    ) -> Result<i32, CoordinatorError> {
        let mut state = self.state.write().await;

        // Re-requests are answered from the existing assignment, no write.
        if let Some(existing) = state.by_service.get(service_id) {
            return Ok(existing.partition);
        }

        let count = match state.topics.get(topic) {
            Some(count) => *count,
            None => {
                let count = self.bus.partition_count(topic).await?;
                state.topics.insert(topic.to_string(), count);
                count
            }
        };

        for index in 0..count as i32 {
            let slot = (topic.to_string(), index);
            if state.by_slot.contains_key(&slot) {
                continue;
            }
            let assignment = Assignment::new(service_id, service_name, topic, index);
            state.by_slot.insert(slot, service_id.to_string());
            state.by_service.insert(service_id.to_string(), assignment);
            tracing::info!(service_id, topic, partition = index, "partition assigned");
            return Ok(index);
        }

        Err(CoordinatorError::Exhausted(topic.to_string()))
    }

    async fn release_partition(&self, service_id: &str) -> Result<(), CoordinatorError> {
        let mut state = self.state.write().await;
        if let Some(assignment) = state.by_service.remove(service_id) {
            state
                .by_slot
                .remove(&(assignment.topic.clone(), assignment.partition));
            tracing::info!(service_id, topic = %assignment.topic, "partition released");
        }
        Ok(())
    }

    async fn get_assignment(
        &self,
        service_id: &str,
    ) -> Result<Option<Assignment>, CoordinatorError> {
        Ok(self.state.read().await.by_service.get(service_id).cloned())
    }

    async fn list_service_ids(&self) -> Result<Vec<String>, CoordinatorError> {
        let mut ids: Vec<String> = self
            .state
            .read()
            .await
            .by_service
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_service_names(&self) -> Result<Vec<String>, CoordinatorError> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .by_service
            .values()
            .map(|assignment| assignment.service_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
impl LocalAssignments {
    /// Age an assignment so sweep tests can cross the minimum-age threshold.
    pub(crate) async fn backdate(&self, service_id: &str, secs: i64) {
        let mut state = self.state.write().await;
        if let Some(assignment) = state.by_service.get_mut(service_id) {
            assignment.assigned_at -= secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_bus::MemoryBus;

    fn assignments(partitions: usize) -> LocalAssignments {
        LocalAssignments::new(Arc::new(MemoryBus::new(partitions)))
    }

    #[tokio::test]
    async fn assigns_lowest_free_index() {
        let store = assignments(3);
        assert_eq!(
            store.request_partition("relay", "bridge", "b-1").await.expect("req"),
            0
        );
        assert_eq!(
            store.request_partition("relay", "bridge", "b-2").await.expect("req"),
            1
        );
        store.release_partition("b-1").await.expect("release");
        assert_eq!(
            store.request_partition("relay", "bridge", "b-3").await.expect("req"),
            0
        );
    }

    #[tokio::test]
    async fn rerequest_is_idempotent() {
        let store = assignments(3);
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
    async fn exhausted_when_all_slots_taken() {
        let store = assignments(1);
        store
            .request_partition("relay", "bridge", "b-1")
            .await
            .expect("req");
        let err = store
            .request_partition("relay", "bridge", "b-2")
            .await
            .expect_err("full");
        assert!(matches!(err, CoordinatorError::Exhausted(_)));
        // The failed request must not have written anything.
        assert_eq!(store.get_assignment("b-2").await.expect("get"), None);
    }

    #[tokio::test]
    async fn release_unknown_id_is_ignored() {
        let store = assignments(1);
        store.release_partition("ghost").await.expect("release");
    }

    #[tokio::test]
    async fn listings_cover_names_and_ids() {
        let store = assignments(4);
        store
            .request_partition("relay", "bridge", "b-1")
            .await
            .expect("req");
        store
            .request_partition("relay", "authority", "a-1")
            .await
            .expect("req");
        assert_eq!(
            store.list_service_ids().await.expect("ids"),
            vec!["a-1".to_string(), "b-1".to_string()]
        );
        assert_eq!(
            store.list_service_names().await.expect("names"),
            vec!["authority".to_string(), "bridge".to_string()]
        );
    }
}
