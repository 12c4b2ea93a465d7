//! Shared storage facade.
//!
//! # Purpose
//! One typed surface over two halves: an in-process TTL mirror that every
//! operation reads and writes first, and a best-effort Redis remote behind it
//! so other nodes can observe sessions, refresh tokens, issuer secrets, and
//! the client-channel directory. The mirror enforces TTLs with an
//! expiry-ordered heap swept at 1 Hz.
use plover_common::{unix_now, ChannelId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod local;
pub mod remote;

pub use local::LocalStore;
pub use remote::{MemoryRemote, RedisStore, RemoteKv};

const REMOTE_PREFIX_RECORD: &str = "session:";
const REMOTE_PREFIX_REFRESH: &str = "refresh:";
const REMOTE_PREFIX_CHANNEL: &str = "channel:";
const REMOTE_PREFIX_SECRET: &str = "secret:";

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Records managed by the facade carry their own key and absolute expiry.
pub trait Expiring: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(&self) -> String;
    fn expires_at(&self) -> i64;
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("remote store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("secret not found for issuer {0}")]
    SecretNotFound(String),
}

/// Record type for facades that only use the refresh/secret/directory key
/// spaces (the authority stores no per-type records of its own).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NullRecord {
    key: String,
    expires_at: i64,
}

impl Expiring for NullRecord {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshEntry {
    token: String,
    user_id: String,
    expires_at: i64,
}

impl Expiring for RefreshEntry {
    fn key(&self) -> String {
        self.token.clone()
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelEntry {
    user_id: String,
    channel_id: ChannelId,
    expires_at: i64,
}

impl Expiring for ChannelEntry {
    fn key(&self) -> String {
        self.user_id.clone()
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

pub struct Store<T: Expiring> {
    channel_id: ChannelId,
    records: LocalStore<T>,
    refresh: LocalStore<RefreshEntry>,
    channels: LocalStore<ChannelEntry>,
    secrets: RwLock<HashMap<String, Vec<u8>>>,
    remote: Option<Arc<dyn RemoteKv>>,
}

impl<T: Expiring> Store<T> {
    pub fn new(channel_id: ChannelId, remote: Option<Arc<dyn RemoteKv>>) -> Self {
        Self {
            channel_id,
            records: LocalStore::new(),
            refresh: LocalStore::new(),
            channels: LocalStore::new(),
            secrets: RwLock::new(HashMap::new()),
            remote,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn set_record(&self, record: T) -> Result<(), StoreError> {
        let ttl = record.expires_at() - unix_now();
        let key = format!("{REMOTE_PREFIX_RECORD}{}", record.key());
        let encoded = serde_json::to_vec(&record)?;
        self.records.set(record);
        if let Some(remote) = &self.remote {
            // A record already past its expiry never reaches the remote.
            if ttl > 0 {
                if let Err(err) = remote.set(&key, &encoded, ttl).await {
                    tracing::warn!(%key, error = %err, "remote record write failed");
                }
            }
        }
        Ok(())
    }

    pub async fn get_record(&self, key: &str) -> Option<T> {
        if let Some(record) = self.records.get(key, unix_now()) {
            return Some(record);
        }
        let remote = self.remote.as_ref()?;
        match remote.get(&format!("{REMOTE_PREFIX_RECORD}{key}")).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%key, error = %err, "remote record read failed");
                None
            }
        }
    }

    pub async fn record_exists(&self, key: &str) -> bool {
        if self.records.exists(key, unix_now()) {
            return true;
        }
        let Some(remote) = self.remote.as_ref() else {
            return false;
        };
        match remote.exists(&format!("{REMOTE_PREFIX_RECORD}{key}")).await {
            Ok(exists) => exists,
            Err(err) => {
                tracing::warn!(%key, error = %err, "remote record exists failed");
                false
            }
        }
    }

    pub async fn remove_record(&self, key: &str) {
        self.records.remove(key);
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.del(&format!("{REMOTE_PREFIX_RECORD}{key}")).await {
                tracing::warn!(%key, error = %err, "remote record delete failed");
            }
        }
    }

    pub async fn save_refresh(&self, token: &str, user_id: &str, ttl: Duration) {
        let expires_at = unix_now() + ttl.as_secs() as i64;
        self.refresh.set(RefreshEntry {
            token: token.to_string(),
            user_id: user_id.to_string(),
            expires_at,
        });
        if let Some(remote) = &self.remote {
            let key = format!("{REMOTE_PREFIX_REFRESH}{token}");
            if let Err(err) = remote
                .set(&key, user_id.as_bytes(), ttl.as_secs() as i64)
                .await
            {
                tracing::warn!(error = %err, "remote refresh write failed");
            }
        }
    }

    pub async fn refresh_user(&self, token: &str) -> Option<String> {
        if let Some(entry) = self.refresh.get(token, unix_now()) {
            return Some(entry.user_id);
        }
        let remote = self.remote.as_ref()?;
        match remote.get(&format!("{REMOTE_PREFIX_REFRESH}{token}")).await {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "remote refresh read failed");
                None
            }
        }
    }

    pub async fn delete_refresh(&self, token: &str) {
        self.refresh.remove(token);
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.del(&format!("{REMOTE_PREFIX_REFRESH}{token}")).await {
                tracing::warn!(error = %err, "remote refresh delete failed");
            }
        }
    }

    /// Publish an issuer secret so other instances can verify tokens we mint.
    pub async fn put_secret(&self, issuer: &str, secret: &[u8]) -> Result<(), StoreError> {
        self.secrets
            .write()
            .expect("secret lock")
            .insert(issuer.to_string(), secret.to_vec());
        if let Some(remote) = &self.remote {
            remote
                .set(&format!("{REMOTE_PREFIX_SECRET}{issuer}"), secret, 0)
                .await?;
        }
        Ok(())
    }

    pub async fn get_secret(&self, issuer: &str) -> Result<Vec<u8>, StoreError> {
        if let Some(secret) = self.secrets.read().expect("secret lock").get(issuer) {
            return Ok(secret.clone());
        }
        let Some(remote) = self.remote.as_ref() else {
            return Err(StoreError::SecretNotFound(issuer.to_string()));
        };
        match remote.get(&format!("{REMOTE_PREFIX_SECRET}{issuer}")).await? {
            Some(secret) => {
                self.secrets
                    .write()
                    .expect("secret lock")
                    .insert(issuer.to_string(), secret.clone());
                Ok(secret)
            }
            None => Err(StoreError::SecretNotFound(issuer.to_string())),
        }
    }

    pub async fn delete_secret(&self, issuer: &str) -> Result<(), StoreError> {
        self.secrets.write().expect("secret lock").remove(issuer);
        if let Some(remote) = &self.remote {
            remote.del(&format!("{REMOTE_PREFIX_SECRET}{issuer}")).await?;
        }
        Ok(())
    }

    /// Record this node as the owner of a user's inbound channel.
    pub async fn set_client_channel(&self, user_id: &str, ttl: Duration) {
        let expires_at = unix_now() + ttl.as_secs() as i64;
        self.channels.set(ChannelEntry {
            user_id: user_id.to_string(),
            channel_id: self.channel_id,
            expires_at,
        });
        if let Some(remote) = &self.remote {
            let key = format!("{REMOTE_PREFIX_CHANNEL}{user_id}");
            let value = self.channel_id.routing_key();
            if let Err(err) = remote
                .set(&key, value.as_bytes(), ttl.as_secs() as i64)
                .await
            {
                tracing::warn!(%user_id, error = %err, "remote channel write failed");
            }
        }
    }

    pub async fn client_channel(&self, user_id: &str) -> Option<ChannelId> {
        if let Some(entry) = self.channels.get(user_id, unix_now()) {
            return Some(entry.channel_id);
        }
        let remote = self.remote.as_ref()?;
        match remote.get(&format!("{REMOTE_PREFIX_CHANNEL}{user_id}")).await {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok()?.parse().ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%user_id, error = %err, "remote channel read failed");
                None
            }
        }
    }

    pub async fn remove_client_channel(&self, user_id: &str) {
        self.channels.remove(user_id);
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.del(&format!("{REMOTE_PREFIX_CHANNEL}{user_id}")).await {
                tracing::warn!(%user_id, error = %err, "remote channel delete failed");
            }
        }
    }

    /// Sweep every local mirror once. Returns the number of entries dropped.
    pub fn sweep(&self, now: i64) -> usize {
        self.records.sweep(now) + self.refresh.sweep(now) + self.channels.sweep(now)
    }
}

/// Spawn the 1 Hz sweeper over a shared facade. Runs until aborted.
pub fn spawn_sweeper<T: Expiring>(store: Arc<Store<T>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = store.sweep(unix_now());
            if removed > 0 {
                tracing::debug!(removed, "storage sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        link_code: String,
        owner: String,
        expires_at: i64,
    }

    impl Expiring for Session {
        fn key(&self) -> String {
            self.link_code.clone()
        }

        fn expires_at(&self) -> i64 {
            self.expires_at
        }
    }

    fn store() -> Store<Session> {
        Store::new(ChannelId(4), None)
    }

    fn session(code: &str, ttl: i64) -> Session {
        Session {
            link_code: code.to_string(),
            owner: "user-a".to_string(),
            expires_at: unix_now() + ttl,
        }
    }

    #[tokio::test]
    async fn record_round_trip() {
        let store = store();
        store.set_record(session("aaaa", 300)).await.expect("set");
        assert!(store.record_exists("aaaa").await);
        let found = store.get_record("aaaa").await.expect("get");
        assert_eq!(found.owner, "user-a");
        store.remove_record("aaaa").await;
        assert!(store.get_record("aaaa").await.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_records() {
        let store = store();
        store.set_record(session("gone", -1)).await.expect("set");
        store.set_record(session("kept", 300)).await.expect("set");
        assert_eq!(store.sweep(unix_now()), 1);
        assert!(store.get_record("gone").await.is_none());
        assert!(store.get_record("kept").await.is_some());
    }

    #[tokio::test]
    async fn refresh_lookup_honors_ttl() {
        let store = store();
        store
            .save_refresh("tok", "user-b", Duration::from_secs(60))
            .await;
        assert_eq!(store.refresh_user("tok").await, Some("user-b".to_string()));
        store.delete_refresh("tok").await;
        assert_eq!(store.refresh_user("tok").await, None);
    }

    #[tokio::test]
    async fn secrets_resolve_locally_for_own_issuer() {
        let store = store();
        store.put_secret("authority-1", b"secret").await.expect("put");
        assert_eq!(store.get_secret("authority-1").await.expect("get"), b"secret");
        let err = store.get_secret("authority-2").await.expect_err("missing");
        assert!(matches!(err, StoreError::SecretNotFound(_)));
    }

    #[tokio::test]
    async fn client_channel_directory_round_trip() {
        let store = store();
        store
            .set_client_channel("user-c", Duration::from_secs(60))
            .await;
        assert_eq!(store.client_channel("user-c").await, Some(ChannelId(4)));
        store.remove_client_channel("user-c").await;
        assert_eq!(store.client_channel("user-c").await, None);
    }

    #[tokio::test]
    async fn facades_share_state_through_the_remote() {
        let remote: Arc<dyn RemoteKv> = Arc::new(MemoryRemote::new());
        let first: Store<Session> = Store::new(ChannelId(0), Some(remote.clone()));
        let second: Store<Session> = Store::new(ChannelId(1), Some(remote));

        first.set_record(session("code", 300)).await.expect("set");
        // The other node resolves the session through the remote store.
        assert!(second.record_exists("code").await);
        let found = second.get_record("code").await.expect("get");
        assert_eq!(found.owner, "user-a");

        first.set_client_channel("user-a", Duration::from_secs(60)).await;
        assert_eq!(second.client_channel("user-a").await, Some(ChannelId(0)));

        first.put_secret("authority-1", b"s").await.expect("put");
        assert_eq!(second.get_secret("authority-1").await.expect("get"), b"s");
    }
}
