//! Coordination-store capability the clustered mode is written against.
//!
//! # Purpose
//! Models the slice of a Zookeeper-style store the coordinator needs:
//! hierarchical nodes, ephemeral-sequential children scoped to a session,
//! child watches, and an atomic multi-op. Adapters for a real external store
//! implement this trait; [`crate::MemoryCoordinationStore`] implements it
//! in-process for single-binary deployments and tests.
use async_trait::async_trait;
use tokio::sync::watch;

/// Child-change signal for one parent path. The value is a version counter;
/// waiters use `changed()` and re-read the children.
pub type ChildrenWatch = watch::Receiver<u64>;

/// Change signal for one node: fires when the node is rewritten or deleted.
pub type NodeWatch = watch::Receiver<u64>;

#[derive(thiserror::Error, Debug)]
pub enum CoordError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("parent missing for: {0}")]
    ParentMissing(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One step of an atomic multi-op commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordOp {
    Create { path: String, data: Vec<u8> },
    Delete { path: String },
}

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create every missing segment of `path`, top down. Idempotent.
    async fn ensure_path(&self, path: &str) -> Result<(), CoordError>;

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError>;

    /// Open a session scoping ephemeral nodes; closing it deletes them all.
    async fn create_session(&self) -> Result<u64, CoordError>;

    async fn close_session(&self, session: u64) -> Result<(), CoordError>;

    /// Create `prefix` + zero-padded sequence as an ephemeral node owned by
    /// `session`. Returns the full node path.
    async fn create_ephemeral_sequential(
        &self,
        session: u64,
        prefix: &str,
    ) -> Result<String, CoordError>;

    /// Direct child names of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch, CoordError>;

    /// Watch one existing node; errors with `NotFound` when it is already
    /// gone. Election losers use this on their immediate predecessor.
    async fn watch_node(&self, path: &str) -> Result<NodeWatch, CoordError>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError>;

    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Apply every op or none: validation happens before the first write.
    async fn multi(&self, ops: Vec<CoordOp>) -> Result<(), CoordError>;
}

/// Numeric suffix of an ephemeral-sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_parses_padded_suffix() {
        assert_eq!(sequence_of("write-0000000042"), Some(42));
        assert_eq!(sequence_of("leader_0000000007"), Some(7));
    }

    #[test]
    fn sequence_rejects_missing_digits() {
        assert_eq!(sequence_of("write-"), None);
        assert_eq!(sequence_of(""), None);
    }
}
