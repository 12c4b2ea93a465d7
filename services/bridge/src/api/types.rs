//! Wire and storage types for the bridge surface.
use plover_common::ChannelId;
use plover_store::Expiring;
use serde::{Deserialize, Serialize};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_MESSAGE: &str = "message";

/// One WebRTC ICE candidate as received from a peer. Fields stay optional so
/// validation can report a malformed candidate instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<i64>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
}

/// SDP-bearing signal payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub sdp: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Opaque session descriptor reply (public-key rendezvous).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSession {
    pub client_id: String,
    pub public_key: String,
}

/// Direct peer-to-peer message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub sender_id: String,
    pub message: String,
}

/// One frame bound for a user's event stream: SSE event name plus payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub kind: String,
    pub data: String,
}

/// First frame of a publish stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCodeGrant {
    pub link_code: String,
    pub expires_at: i64,
}

/// Stored rendezvous session, mirrored locally and in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSession {
    pub link_code: String,
    pub owner_user_id: String,
    pub owner_channel_id: ChannelId,
    pub payload: Vec<u8>,
    pub expires_at: i64,
}

impl Expiring for LinkSession {
    fn key(&self) -> String {
        self.link_code.clone()
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

/// Envelopes exchanged between bridges over the relay topic. Untagged so the
/// wire shapes stay exactly `{link_code, signal}`, `{client_id, payload}`,
/// and `{link_code, revoked}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusEnvelope {
    Signal {
        link_code: String,
        signal: serde_json::Value,
    },
    Message {
        client_id: String,
        payload: Vec<u8>,
    },
    Revoke {
        link_code: String,
        revoked: bool,
    },
}
