//! Remote half of the storage facade.
//!
//! # Purpose
//! A small key-value capability other nodes can observe. The Redis
//! implementation probes `CLUSTER INFO` once at connect: a reply carrying
//! `cluster_enabled:1` routes every operation through the cluster client,
//! anything else sticks with the single-node client. The in-memory
//! implementation gives several facades one shared view for single-binary
//! runs and tests.
use async_trait::async_trait;
use plover_common::unix_now;
use redis::aio::ConnectionLike;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait RemoteKv: Send + Sync + 'static {
    async fn set(&self, key: &str, value: &[u8], ttl_secs: i64) -> Result<(), redis::RedisError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, redis::RedisError>;
    async fn exists(&self, key: &str) -> Result<bool, redis::RedisError>;
    async fn del(&self, key: &str) -> Result<(), redis::RedisError>;
}

#[derive(Clone)]
enum Backend {
    Single(redis::Client),
    Cluster(redis::cluster::ClusterClient),
}

/// Redis-backed remote store, single-node or cluster.
#[derive(Clone)]
pub struct RedisStore {
    backend: Backend,
}

impl RedisStore {
    /// Connect and detect cluster mode from the server's own cluster info.
    pub async fn connect(addr: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(addr)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let info: String = redis::cmd("CLUSTER")
            .arg("INFO")
            .query_async(&mut conn)
            .await
            .unwrap_or_default();

        let backend = if info.contains("cluster_enabled:1") {
            tracing::info!(%addr, "remote store is cluster mode");
            Backend::Cluster(redis::cluster::ClusterClient::new(vec![addr.to_string()])?)
        } else {
            Backend::Single(client)
        };

        Ok(Self { backend })
    }

    async fn run<T: redis::FromRedisValue>(
        &self,
        cmd: redis::Cmd,
    ) -> Result<T, redis::RedisError> {
        match &self.backend {
            Backend::Single(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                query(&cmd, &mut conn).await
            }
            Backend::Cluster(client) => {
                let mut conn = client.get_async_connection().await?;
                query(&cmd, &mut conn).await
            }
        }
    }
}

async fn query<T: redis::FromRedisValue, C: ConnectionLike>(
    cmd: &redis::Cmd,
    conn: &mut C,
) -> Result<T, redis::RedisError> {
    cmd.query_async(conn).await
}

#[async_trait]
impl RemoteKv for RedisStore {
    async fn set(&self, key: &str, value: &[u8], ttl_secs: i64) -> Result<(), redis::RedisError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        self.run(cmd).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, redis::RedisError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn exists(&self, key: &str) -> Result<bool, redis::RedisError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(cmd).await
    }
}

/// Shared in-process remote for single-binary runs and tests: several
/// facades pointed at one instance observe each other's writes.
#[derive(Default)]
pub struct MemoryRemote {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<i64>)>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteKv for MemoryRemote {
    async fn set(&self, key: &str, value: &[u8], ttl_secs: i64) -> Result<(), redis::RedisError> {
        let expires_at = (ttl_secs > 0).then(|| unix_now() + ttl_secs);
        self.entries
            .lock()
            .expect("remote lock")
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, redis::RedisError> {
        let mut entries = self.entries.lock().expect("remote lock");
        match entries.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= unix_now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, redis::RedisError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), redis::RedisError> {
        self.entries.lock().expect("remote lock").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_remote_round_trip() {
        let remote = MemoryRemote::new();
        remote.set("k", b"v", 60).await.expect("set");
        assert_eq!(remote.get("k").await.expect("get"), Some(b"v".to_vec()));
        assert!(remote.exists("k").await.expect("exists"));
        remote.del("k").await.expect("del");
        assert_eq!(remote.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn memory_remote_honors_ttl() {
        let remote = MemoryRemote::new();
        // Zero TTL means no expiry, matching a plain SET.
        remote.set("forever", b"v", 0).await.expect("set");
        assert!(remote.exists("forever").await.expect("exists"));

        remote.set("brief", b"v", 60).await.expect("set");
        assert!(remote.exists("brief").await.expect("exists"));
    }
}
