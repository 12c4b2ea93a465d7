//! Leader election over ephemeral-sequential nodes.
//!
//! Every coordinator instance joins by creating a node under the election
//! path; the lowest sequence is the leader. A loser watches only its
//! immediate predecessor and re-evaluates when that node vanishes, so
//! leadership moves as soon as the previous holder's session ends without
//! waking the whole field on every change. Only the leader runs the failure
//! sweep; every instance keeps serving assignment requests.
use crate::coordination::{sequence_of, CoordError, CoordinationStore};
use std::sync::Arc;
use std::time::Duration;

pub const ELECTION_PREFIX: &str = "leader_";

// Fallback recheck cadence if a watch event is missed.
const RECHECK: Duration = Duration::from_secs(2);

pub struct Election {
    store: Arc<dyn CoordinationStore>,
    path: String,
    node: String,
}

impl Election {
    /// Enter the election by creating this instance's candidate node.
    pub async fn join(
        store: Arc<dyn CoordinationStore>,
        path: &str,
        session: u64,
    ) -> Result<Self, CoordError> {
        store.ensure_path(path).await?;
        let node = store
            .create_ephemeral_sequential(session, &format!("{path}/{ELECTION_PREFIX}"))
            .await?;
        tracing::info!(%node, "joined leader election");
        Ok(Self {
            store,
            path: path.to_string(),
            node,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn sequence(&self) -> Result<u64, CoordError> {
        sequence_of(&self.node).ok_or_else(|| CoordError::NotFound(self.node.clone()))
    }

    pub async fn is_leader(&self) -> Result<bool, CoordError> {
        let my_seq = self.sequence()?;
        let children = self.store.children(&self.path).await?;
        let lowest = children
            .iter()
            .filter_map(|name| sequence_of(name))
            .min()
            .unwrap_or(my_seq);
        Ok(lowest == my_seq)
    }

    // Candidate node directly ahead of ours, by sequence.
    async fn predecessor(&self) -> Result<Option<String>, CoordError> {
        let my_seq = self.sequence()?;
        let children = self.store.children(&self.path).await?;
        Ok(children
            .into_iter()
            .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
            .filter(|(seq, _)| *seq < my_seq)
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, name)| name))
    }

    /// Resolve once this instance holds leadership. Losers watch their
    /// immediate predecessor and re-evaluate when it vanishes; only a
    /// predecessor's exit can promote us.
    pub async fn wait_leadership(&self) -> Result<(), CoordError> {
        loop {
            if self.is_leader().await? {
                tracing::info!(node = %self.node, "elected leader");
                return Ok(());
            }
            let Some(predecessor) = self.predecessor().await? else {
                // Raced a predecessor exit; re-evaluate immediately.
                continue;
            };
            match self
                .store
                .watch_node(&format!("{}/{predecessor}", self.path))
                .await
            {
                Ok(mut watch) => {
                    tokio::select! {
                        _ = watch.changed() => {}
                        _ = tokio::time::sleep(RECHECK) => {}
                    }
                }
                // Gone between listing and watching; re-evaluate.
                Err(CoordError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryCoordinationStore;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn first_joiner_leads() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let session = store.create_session().await.expect("session");
        let election = Election::join(store.clone(), "/base/leader", session)
            .await
            .expect("join");
        assert!(election.is_leader().await.expect("check"));
    }

    #[tokio::test]
    async fn second_joiner_follows_then_takes_over() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let first_session = store.create_session().await.expect("session");
        let first = Election::join(store.clone(), "/base/leader", first_session)
            .await
            .expect("join");
        let second_session = store.create_session().await.expect("session");
        let second = Election::join(store.clone(), "/base/leader", second_session)
            .await
            .expect("join");

        assert!(first.is_leader().await.expect("check"));
        assert!(!second.is_leader().await.expect("check"));
        assert_eq!(
            second.predecessor().await.expect("predecessor").as_deref(),
            first.node().rsplit('/').next()
        );

        let promoted = tokio::spawn(async move {
            second.wait_leadership().await.expect("wait");
            second
        });

        // Leader's session ends; the follower must be promoted.
        store.close_session(first_session).await.expect("close");
        let second = timeout(WAIT, promoted).await.expect("no hang").expect("join");
        assert!(second.is_leader().await.expect("check"));
    }

    #[tokio::test]
    async fn third_joiner_survives_a_middle_exit() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let first_session = store.create_session().await.expect("session");
        let _first = Election::join(store.clone(), "/base/leader", first_session)
            .await
            .expect("join");
        let middle_session = store.create_session().await.expect("session");
        let _middle = Election::join(store.clone(), "/base/leader", middle_session)
            .await
            .expect("join");
        let third_session = store.create_session().await.expect("session");
        let third = Election::join(store.clone(), "/base/leader", third_session)
            .await
            .expect("join");

        let promoted = tokio::spawn(async move {
            third.wait_leadership().await.expect("wait");
            third
        });

        // The middle candidate exits first: the third must re-watch the head
        // rather than claim leadership.
        store.close_session(middle_session).await.expect("close");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!promoted.is_finished());

        store.close_session(first_session).await.expect("close");
        let third = timeout(WAIT, promoted).await.expect("no hang").expect("join");
        assert!(third.is_leader().await.expect("check"));
    }
}
