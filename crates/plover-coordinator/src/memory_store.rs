//! In-process coordination store.
//!
//! Backs single-binary deployments and every protocol test. Ephemeral nodes
//! belong to a numbered session and vanish when it closes; `multi` validates
//! all operations before applying any, so a failed commit leaves no partial
//! state behind.
use crate::coordination::{ChildrenWatch, CoordError, CoordOp, CoordinationStore, NodeWatch};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;

struct Node {
    data: Vec<u8>,
    ephemeral_session: Option<u64>,
}

struct State {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, HashSet<String>>,
    watches: HashMap<String, watch::Sender<u64>>,
    node_watches: HashMap<String, watch::Sender<u64>>,
    next_session: u64,
    next_sequence: u64,
}

pub struct MemoryCoordinationStore {
    state: Mutex<State>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes: BTreeMap::new(),
                sessions: HashMap::new(),
                watches: HashMap::new(),
                node_watches: HashMap::new(),
                next_session: 1,
                next_sequence: 1,
            }),
        }
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let index = path.rfind('/')?;
    if index == 0 { Some("/") } else { Some(&path[..index]) }
}

impl State {
    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(node_path, _)| node_path.starts_with(&prefix))
            .filter(|(node_path, _)| !node_path[prefix.len()..].contains('/'))
            .map(|(node_path, _)| node_path[prefix.len()..].to_string())
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        !self.child_names(path).is_empty()
    }

    fn notify(&mut self, parent: &str) {
        if let Some(sender) = self.watches.get(parent) {
            sender.send_modify(|version| *version += 1);
        }
    }

    fn notify_node(&mut self, path: &str) {
        if let Some(sender) = self.node_watches.get(path) {
            sender.send_modify(|version| *version += 1);
        }
    }

    fn validate_create(&self, path: &str) -> Result<(), CoordError> {
        if self.nodes.contains_key(path) {
            return Err(CoordError::AlreadyExists(path.to_string()));
        }
        match parent_of(path) {
            Some("/") | None => Ok(()),
            Some(parent) if self.nodes.contains_key(parent) => Ok(()),
            Some(_) => Err(CoordError::ParentMissing(path.to_string())),
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, session: Option<u64>) {
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_session: session,
            },
        );
        if let Some(session) = session {
            self.sessions
                .entry(session)
                .or_default()
                .insert(path.to_string());
        }
        if let Some(parent) = parent_of(path) {
            self.notify(&parent.to_string());
        }
    }

    fn remove(&mut self, path: &str) -> Option<Node> {
        let node = self.nodes.remove(path)?;
        if let Some(session) = node.ephemeral_session {
            if let Some(owned) = self.sessions.get_mut(&session) {
                owned.remove(path);
            }
        }
        if let Some(parent) = parent_of(path) {
            self.notify(&parent.to_string());
        }
        self.notify_node(path);
        Some(node)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn ensure_path(&self, path: &str) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.nodes.contains_key(&current) {
                state.insert(&current, Vec::new(), None);
            }
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        state.validate_create(path)?;
        state.insert(path, data, None);
        Ok(())
    }

    async fn create_session(&self) -> Result<u64, CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        let session = state.next_session;
        state.next_session += 1;
        state.sessions.insert(session, HashSet::new());
        Ok(session)
    }

    async fn close_session(&self, session: u64) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        let owned = state
            .sessions
            .remove(&session)
            .ok_or(CoordError::UnknownSession(session))?;
        for path in owned {
            state.remove(&path);
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        session: u64,
        prefix: &str,
    ) -> Result<String, CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        if !state.sessions.contains_key(&session) {
            return Err(CoordError::UnknownSession(session));
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let path = format!("{prefix}{sequence:010}");
        state.validate_create(&path)?;
        state.insert(&path, Vec::new(), Some(session));
        Ok(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let state = self.state.lock().expect("coordination lock");
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        Ok(state.child_names(path))
    }

    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch, CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        let sender = state
            .watches
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(0).0);
        Ok(sender.subscribe())
    }

    async fn watch_node(&self, path: &str) -> Result<NodeWatch, CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let sender = state
            .node_watches
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(0).0);
        Ok(sender.subscribe())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        let state = self.state.lock().expect("coordination lock");
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("coordination lock");
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        if state.has_children(path) {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        state.remove(path);
        Ok(())
    }

    async fn multi(&self, ops: Vec<CoordOp>) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("coordination lock");

        // Validate the whole batch against current state before any write.
        {
            let mut created: HashSet<&str> = HashSet::new();
            let mut deleted: HashSet<&str> = HashSet::new();
            for op in &ops {
                match op {
                    CoordOp::Create { path, .. } => {
                        if created.contains(path.as_str()) {
                            return Err(CoordError::AlreadyExists(path.clone()));
                        }
                        if !deleted.contains(path.as_str()) {
                            state.validate_create(path)?;
                        }
                        created.insert(path);
                    }
                    CoordOp::Delete { path } => {
                        if !state.nodes.contains_key(path) && !created.contains(path.as_str()) {
                            return Err(CoordError::NotFound(path.clone()));
                        }
                        if state.has_children(path) {
                            return Err(CoordError::NotEmpty(path.clone()));
                        }
                        deleted.insert(path);
                    }
                }
            }
        }

        for op in ops {
            match op {
                CoordOp::Create { path, data } => state.insert(&path, data, None),
                CoordOp::Delete { path } => {
                    state.remove(&path);
                }
            }
        }
        Ok(())
    }
}
