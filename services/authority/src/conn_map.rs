//! Live client connection map.
//!
//! One entry per authenticated user, owned exclusively by this instance.
//! The value is the sending half feeding that user's WebSocket writer task;
//! pushes from the RPC surface and the bus consumer go through it.
use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub struct ConnMap {
    connections: DashMap<String, mpsc::Sender<Message>>,
}

impl ConnMap {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn set(&self, user_id: &str, sender: mpsc::Sender<Message>) {
        self.connections.insert(user_id.to_string(), sender);
    }

    pub fn get(&self, user_id: &str) -> Option<mpsc::Sender<Message>> {
        self.connections
            .get(user_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, user_id: &str) {
        self.connections.remove(user_id);
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Push raw payload bytes to a connected user as a text frame. A missing
    /// or gone connection is not an error; the user may have disconnected.
    pub async fn push(&self, user_id: &str, payload: &[u8]) -> bool {
        let Some(sender) = self.get(user_id) else {
            return false;
        };
        let frame = Message::Text(String::from_utf8_lossy(payload).into_owned());
        sender.send(frame).await.is_ok()
    }
}

impl Default for ConnMap {
    fn default() -> Self {
        Self::new()
    }
}
