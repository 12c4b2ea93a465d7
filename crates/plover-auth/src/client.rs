//! HTTP client for the authority's internal RPC surface, plus the push
//! message envelopes shared between the authority and the bridges.
use crate::Claims;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use plover_common::ChannelId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline on the verify RPC; the caller re-attempts, we never retry here.
pub const VERIFY_DEADLINE: Duration = Duration::from_secs(1);
const PUSH_DEADLINE: Duration = Duration::from_secs(2);

pub const MESSAGE_KIND_AUTHORIZATION: &str = "Authorization";
pub const MESSAGE_KIND_SIGNALING: &str = "signaling";
pub const MESSAGE_KIND_RELAY: &str = "message-relay";

/// Envelope pushed over a client's persistent authority connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: T,
}

impl<T> ClientMessage<T> {
    pub fn new(kind: &str, content: T) -> Self {
        Self {
            kind: kind.to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub refresh_token: String,
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub access_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub channel_id: ChannelId,
    pub client_id: String,
    // Raw payload bytes, base64-encoded for the JSON body.
    pub message: String,
}

impl PushRequest {
    pub fn new(channel_id: ChannelId, client_id: &str, message: &[u8]) -> Self {
        Self {
            channel_id,
            client_id: client_id.to_string(),
            message: STANDARD.encode(message),
        }
    }

    pub fn message_bytes(&self) -> Result<Vec<u8>, ClientError> {
        STANDARD
            .decode(&self.message)
            .map_err(|_| ClientError::MalformedResponse)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("authority request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token rejected by authority")]
    Denied,
    #[error("authority returned status {0}")]
    Status(u16),
    #[error("malformed authority response")]
    MalformedResponse,
}

/// Client for `POST /internal/verify` and `POST /internal/push`.
#[derive(Clone)]
pub struct AuthorityClient {
    base_url: String,
    http: reqwest::Client,
}

impl AuthorityClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn verify(&self, access_token: &str) -> Result<Claims, ClientError> {
        let url = format!("{}/internal/verify", self.base_url);
        let response = self
            .http
            .post(url)
            .timeout(VERIFY_DEADLINE)
            .json(&VerifyRequest {
                access_token: access_token.to_string(),
            })
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Denied);
        }
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        Ok(response.json::<Claims>().await?)
    }

    pub async fn push(
        &self,
        channel_id: ChannelId,
        client_id: &str,
        message: &[u8],
    ) -> Result<(), ClientError> {
        let url = format!("{}/internal/push", self.base_url);
        let response = self
            .http
            .post(url)
            .timeout(PUSH_DEADLINE)
            .json(&PushRequest::new(channel_id, client_id, message))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let body: PushResponse = response.json().await?;
        if body.success {
            Ok(())
        } else {
            Err(ClientError::MalformedResponse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_request_round_trips_bytes() {
        let request = PushRequest::new(ChannelId(1), "client-a", b"payload");
        assert_eq!(request.message_bytes().expect("decode"), b"payload");
    }

    #[test]
    fn client_message_serializes_type_field() {
        let message = ClientMessage::new(
            MESSAGE_KIND_AUTHORIZATION,
            AuthorizationGrant {
                refresh_token: "r".to_string(),
                access_token: "a".to_string(),
                expires_at: 10,
            },
        );
        let json = serde_json::to_value(&message).expect("encode");
        assert_eq!(json["type"], "Authorization");
        assert_eq!(json["content"]["expires_at"], 10);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = AuthorityClient::new("http://127.0.0.1:9000/");
        assert_eq!(client.base_url, "http://127.0.0.1:9000");
    }
}
