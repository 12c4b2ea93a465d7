// Shared data types and small helpers used across crates.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod expiry;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),
    #[error("config error: {0}")]
    Config(String),
}

/// Bus partition a user's inbound traffic is pinned to for the lifetime of a
/// token.
///
/// ```
/// use plover_common::ChannelId;
///
/// let channel = ChannelId(3);
/// assert_eq!(channel.to_string(), "3");
/// assert_eq!("3".parse::<ChannelId>().unwrap(), channel);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChannelId(pub i32);

impl ChannelId {
    pub fn as_i32(&self) -> i32 {
        self.0
    }

    // String form used as the routing key in key-sharded bus mode.
    pub fn routing_key(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        input
            .parse::<i32>()
            .map(ChannelId)
            .map_err(|_| Error::InvalidChannelId(input.into()))
    }
}

/// Generate a default service id of the form `<name>-<random-hex>`.
pub fn service_id(name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: u32 = rng.gen();
    format!("{name}-{suffix:08x}")
}

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_round_trip() {
        let channel = ChannelId(7);
        let parsed: ChannelId = channel.to_string().parse().expect("parse");
        assert_eq!(channel, parsed);
    }

    #[test]
    fn channel_id_rejects_garbage() {
        let err = "abc".parse::<ChannelId>().expect_err("invalid");
        assert!(matches!(err, Error::InvalidChannelId(s) if s == "abc"));
    }

    #[test]
    fn channel_id_serde_is_transparent() {
        let json = serde_json::to_string(&ChannelId(5)).expect("encode");
        assert_eq!(json, "5");
        let back: ChannelId = serde_json::from_str("5").expect("decode");
        assert_eq!(back, ChannelId(5));
    }

    #[test]
    fn service_id_carries_name_prefix() {
        let id = service_id("bridge");
        assert!(id.starts_with("bridge-"));
        assert_eq!(id.len(), "bridge-".len() + 8);
    }

    #[test]
    fn service_ids_differ() {
        assert_ne!(service_id("a"), service_id("a"));
    }
}
