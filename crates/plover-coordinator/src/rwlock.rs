//! Distributed read/write lock over ephemeral-sequential nodes.
//!
//! # Purpose
//! Serializes assignment mutations across coordinator instances. Acquirers
//! create a `read-` or `write-` prefixed ephemeral-sequential child under the
//! lock path. A writer holds the lock once its sequence is the lowest among
//! all children; a reader only has to precede every writer. Waiters watch the
//! lock path and retry on change or after a timed backoff (2 s doubling to
//! 10 s, reset by each event). Releasing deletes the own node; session
//! ephemerality covers crashed holders.
use crate::coordination::{sequence_of, ChildrenWatch, CoordError, CoordinationStore};
use std::sync::Arc;
use std::time::Duration;

pub const READ_PREFIX: &str = "read-";
pub const WRITE_PREFIX: &str = "write-";

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
pub const BACKOFF_MAX: Duration = Duration::from_secs(10);

pub struct DistributedRwLock {
    store: Arc<dyn CoordinationStore>,
    path: String,
    session: u64,
}

/// Held lock; dropping without [`LockGuard::release`] leaves cleanup to the
/// session.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    node: String,
}

impl LockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn release(self) -> Result<(), CoordError> {
        self.store.delete(&self.node).await
    }
}

impl DistributedRwLock {
    pub fn new(store: Arc<dyn CoordinationStore>, path: &str, session: u64) -> Self {
        Self {
            store,
            path: path.to_string(),
            session,
        }
    }

    pub async fn write(&self) -> Result<LockGuard, CoordError> {
        self.acquire(WRITE_PREFIX, write_acquired).await
    }

    pub async fn read(&self) -> Result<LockGuard, CoordError> {
        self.acquire(READ_PREFIX, read_acquired).await
    }

    async fn acquire(
        &self,
        prefix: &str,
        acquired: fn(&[String], u64) -> bool,
    ) -> Result<LockGuard, CoordError> {
        let node = self
            .store
            .create_ephemeral_sequential(self.session, &format!("{}/{prefix}", self.path))
            .await?;
        let my_seq = sequence_of(&node).ok_or_else(|| CoordError::NotFound(node.clone()))?;

        let mut backoff = BACKOFF_INITIAL;
        loop {
            // Take the watch before reading so a change between the two is
            // never missed.
            let watch = match self.store.watch_children(&self.path).await {
                Ok(watch) => watch,
                Err(err) => {
                    let _ = self.store.delete(&node).await;
                    return Err(err);
                }
            };
            let names = match self.store.children(&self.path).await {
                Ok(names) => names,
                Err(err) => {
                    let _ = self.store.delete(&node).await;
                    return Err(err);
                }
            };

            if acquired(&names, my_seq) {
                return Ok(LockGuard {
                    store: self.store.clone(),
                    node,
                });
            }

            tracing::debug!(path = %self.path, seq = my_seq, "waiting on lock");
            wait_for_change(watch, &mut backoff).await;
        }
    }
}

// A writer needs the lowest sequence among all lock children.
fn write_acquired(names: &[String], my_seq: u64) -> bool {
    names
        .iter()
        .filter_map(|name| sequence_of(name))
        .all(|seq| seq >= my_seq)
}

// A reader only yields to writers that precede it.
fn read_acquired(names: &[String], my_seq: u64) -> bool {
    !names
        .iter()
        .filter(|name| name.starts_with(WRITE_PREFIX))
        .filter_map(|name| sequence_of(name))
        .any(|seq| seq < my_seq)
}

async fn wait_for_change(mut watch: ChildrenWatch, backoff: &mut Duration) {
    tokio::select! {
        changed = watch.changed() => {
            if changed.is_ok() {
                *backoff = BACKOFF_INITIAL;
            }
        }
        _ = tokio::time::sleep(*backoff) => {
            *backoff = (*backoff * 2).min(BACKOFF_MAX);
        }
    }
}
