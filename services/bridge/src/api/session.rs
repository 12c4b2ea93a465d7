//! Link-code lifecycle: publish, lookup, forward, revoke.
use crate::api::types::{BusEnvelope, LinkCodeGrant, LinkSession, PeerSession, SignalData};
use crate::api::{
    api_exhausted, api_malformed, api_no_route, api_not_owner, api_session_not_found,
    api_upstream, ApiError,
};
use crate::auth::AuthClaims;
use crate::{AppState, BridgeStore};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use plover_auth::client::{ClientMessage, PushRequest, MESSAGE_KIND_RELAY, MESSAGE_KIND_SIGNALING};
use plover_bus::Bus;
use plover_common::unix_now;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// Visually ambiguous characters removed: no l, I, G, O.
const LINK_CODE_ALPHABET: &[u8] =
    b"abcdefghijkmnopqrstuvwxyzABCDEFHJKLMNPQRSTUVWXYZ0123456789";
const LINK_CODE_LENGTH: usize = 8;
const LINK_CODE_MAX_ATTEMPTS: usize = 5;
pub const LINK_CODE_TTL: Duration = Duration::from_secs(300);

pub(crate) fn random_link_code<R: Rng>(rng: &mut R) -> String {
    (0..LINK_CODE_LENGTH)
        .map(|_| {
            let index = rng.gen_range(0..LINK_CODE_ALPHABET.len());
            LINK_CODE_ALPHABET[index] as char
        })
        .collect()
}

pub(crate) async fn generate_unique_link_code<R: Rng>(
    store: &BridgeStore,
    rng: &mut R,
) -> Option<String> {
    for _ in 0..LINK_CODE_MAX_ATTEMPTS {
        let code = random_link_code(rng);
        if !store.record_exists(&code).await {
            return Some(code);
        }
    }
    None
}

// An SDP is well-formed when form-decoding its newline-joined lines yields
// every required description key.
pub(crate) fn valid_sdp(raw: &str) -> bool {
    let joined = raw.replace('\n', "&");
    let keys: HashSet<String> = form_urlencoded::parse(joined.as_bytes())
        .map(|(key, _)| key.into_owned())
        .collect();
    ["v", "o", "s", "m", "c", "a"]
        .iter()
        .all(|key| keys.contains(*key))
}

pub(crate) fn valid_candidates(candidates: &[crate::api::types::Candidate]) -> bool {
    candidates.iter().all(|candidate| {
        candidate.candidate.is_some()
            && candidate.sdp_mline_index.is_some()
            && candidate.sdp_mid.is_some()
    })
}

/// Publish a rendezvous session. The response streams: the link-code grant
/// immediately, then either the counterpart's reply (local-channel mode) or
/// nothing (unified mode, the stream is only a presence signal), until the
/// code expires or the peer disconnects.
pub async fn publish_session(
    State(state): State<AppState>,
    claims: AuthClaims,
    body: Bytes,
) -> Result<Response, ApiError> {
    let link_code = generate_unique_link_code(&state.store, &mut OsRng)
        .await
        .ok_or_else(|| api_exhausted("failed to generate a unique link code"))?;
    let expires_at = unix_now() + LINK_CODE_TTL.as_secs() as i64;

    // In unified mode the reply routes through the authority partition the
    // token was minted against; otherwise through this bridge's own.
    let owner_channel_id = if state.unified_push {
        claims.0.channel_id
    } else {
        state.channel_id
    };

    let session = LinkSession {
        link_code: link_code.clone(),
        owner_user_id: claims.0.user_id.clone(),
        owner_channel_id,
        payload: body.to_vec(),
        expires_at,
    };
    state
        .store
        .set_record(session)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "session store write failed");
            api_upstream("failed to store session")
        })?;

    tracing::info!(%link_code, owner = %claims.0.user_id, "session published");
    metrics::counter!("bridge_sessions_published_total").increment(1);

    let signal_rx = (!state.unified_push).then(|| state.signals.add(&link_code));
    let (frame_tx, frame_rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
    tokio::spawn(run_publish_stream(
        state.clone(),
        link_code,
        expires_at,
        frame_tx,
        signal_rx,
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(frame_rx)))
        .map_err(|_| api_upstream("failed to build response"))
}

async fn run_publish_stream(
    state: AppState,
    link_code: String,
    expires_at: i64,
    frame_tx: mpsc::Sender<Result<Bytes, Infallible>>,
    signal_rx: Option<mpsc::Receiver<Bytes>>,
) {
    let grant = LinkCodeGrant {
        link_code: link_code.clone(),
        expires_at,
    };
    let first = serde_json::to_vec(&grant).unwrap_or_default();
    if frame_tx.send(Ok(Bytes::from(first))).await.is_err() {
        finish_publish_stream(&state, &link_code).await;
        return;
    }

    let ttl = Duration::from_secs((expires_at - unix_now()).max(0) as u64);
    match signal_rx {
        // Unified mode: the stream is held open purely as a presence signal.
        None => {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    let _ = frame_tx.send(Ok(timeout_frame())).await;
                }
                _ = frame_tx.closed() => {}
            }
        }
        // Local-channel mode: the next forward to this code lands here and
        // is written to the stream as the second frame.
        Some(mut receiver) => {
            tokio::select! {
                reply = receiver.recv() => {
                    if let Some(frame) = reply {
                        let _ = frame_tx.send(Ok(frame)).await;
                    }
                }
                _ = tokio::time::sleep(ttl) => {
                    let _ = frame_tx.send(Ok(timeout_frame())).await;
                }
                _ = frame_tx.closed() => {}
            }
        }
    }

    finish_publish_stream(&state, &link_code).await;
}

// Stream closure removes the session from both stores, whatever ended it.
async fn finish_publish_stream(state: &AppState, link_code: &str) {
    state.signals.remove(link_code);
    state.store.remove_record(link_code).await;
    tracing::debug!(%link_code, "publish stream closed");
}

fn timeout_frame() -> Bytes {
    Bytes::from_static(br#"{"code":"request_timeout","message":"session expired"}"#)
}

pub async fn get_session(
    State(state): State<AppState>,
    _claims: AuthClaims,
    Path(link_code): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_record(&link_code)
        .await
        .ok_or_else(|| api_session_not_found("session not found"))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(session.payload))
        .map_err(|_| api_upstream("failed to build response"))
}

/// Answer a rendezvous: deliver the caller's descriptor to the owner and
/// return the owner's stored descriptor.
pub async fn forward_session(
    State(state): State<AppState>,
    claims: AuthClaims,
    Path(link_code): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_record(&link_code)
        .await
        .ok_or_else(|| api_session_not_found("session not found"))?;

    let reply = build_reply(&claims.0.user_id, &body)?;
    dispatch_reply(&state, &session, &link_code, reply).await?;
    metrics::counter!("bridge_signals_forwarded_total").increment(1);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(session.payload))
        .map_err(|_| api_upstream("failed to build response"))
}

// A body that decodes as an SDP signal must validate; anything else is an
// opaque session descriptor.
fn build_reply(sender_id: &str, body: &[u8]) -> Result<serde_json::Value, ApiError> {
    match serde_json::from_slice::<SignalData>(body) {
        Ok(mut signal) => {
            if !valid_sdp(&signal.sdp) || !valid_candidates(&signal.candidates) {
                return Err(api_malformed("invalid SDP or candidates"));
            }
            signal.client_id = sender_id.to_string();
            serde_json::to_value(&signal).map_err(|_| api_upstream("failed to encode signal"))
        }
        Err(_) => {
            let peer = PeerSession {
                client_id: sender_id.to_string(),
                public_key: String::from_utf8_lossy(body).into_owned(),
            };
            serde_json::to_value(&peer).map_err(|_| api_upstream("failed to encode session"))
        }
    }
}

async fn dispatch_reply(
    state: &AppState,
    session: &LinkSession,
    link_code: &str,
    reply: serde_json::Value,
) -> Result<(), ApiError> {
    if state.unified_push {
        let kind = if reply.get("sdp").is_some() {
            MESSAGE_KIND_SIGNALING
        } else {
            MESSAGE_KIND_RELAY
        };
        let message = ClientMessage::new(kind, reply);
        let message_bytes =
            serde_json::to_vec(&message).map_err(|_| api_upstream("failed to encode message"))?;

        if let Some(bus) = &state.bus {
            let envelope = PushRequest::new(
                session.owner_channel_id,
                &session.owner_user_id,
                &message_bytes,
            );
            let payload = serde_json::to_vec(&envelope)
                .map_err(|_| api_upstream("failed to encode envelope"))?;
            bus.send(&state.push_topic, session.owner_channel_id, Bytes::from(payload))
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "push bus send failed");
                    api_upstream("failed to forward signal")
                })?;
            return Ok(());
        }
        if let Some(authority) = &state.authority {
            authority
                .push(
                    session.owner_channel_id,
                    &session.owner_user_id,
                    &message_bytes,
                )
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "authority push failed");
                    api_upstream("failed to forward signal")
                })?;
            return Ok(());
        }
        return Err(api_no_route("no delivery path to session owner"));
    }

    let frame = Bytes::from(
        serde_json::to_vec(&reply).map_err(|_| api_upstream("failed to encode signal"))?,
    );

    // Owner waiting on this bridge: hand the reply straight to its stream.
    if state.signals.deliver(link_code, frame).await {
        return Ok(());
    }

    // Otherwise the owner is on the bridge consuming its channel partition.
    if let Some(bus) = &state.bus {
        let envelope = BusEnvelope::Signal {
            link_code: link_code.to_string(),
            signal: reply,
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|_| api_upstream("failed to encode envelope"))?;
        bus.send(
            &state.relay_topic,
            session.owner_channel_id,
            Bytes::from(payload),
        )
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "relay bus send failed");
            api_upstream("failed to forward signal")
        })?;
        return Ok(());
    }

    Err(api_no_route("no delivery path to session owner"))
}

/// Only the owner may revoke; other bridges learn through a best-effort
/// revoke broadcast and release their waiters.
pub async fn revoke_session(
    State(state): State<AppState>,
    claims: AuthClaims,
    Path(link_code): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .store
        .get_record(&link_code)
        .await
        .ok_or_else(|| api_session_not_found("session not found"))?;

    if claims.0.user_id != session.owner_user_id {
        return Err(api_not_owner());
    }

    state.signals.remove(&link_code);
    state.store.remove_record(&link_code).await;

    if let Some(bus) = &state.bus {
        let envelope = BusEnvelope::Revoke {
            link_code: link_code.clone(),
            revoked: true,
        };
        if let Ok(payload) = serde_json::to_vec(&envelope) {
            if let Err(err) = bus
                .send(
                    &state.relay_topic,
                    session.owner_channel_id,
                    Bytes::from(payload),
                )
                .await
            {
                tracing::warn!(error = %err, "revoke broadcast failed");
            }
        }
    }

    tracing::info!(%link_code, "session revoked");
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::Candidate;
    use plover_common::ChannelId;
    use rand::rngs::mock::StepRng;

    const VALID_SDP: &str = "v=0\no=alice 1 1 IN IP4 0.0.0.0\ns=session\nm=audio 9 RTP 0\nc=IN IP4 0.0.0.0\na=sendrecv";

    #[test]
    fn link_code_uses_alphabet_and_length() {
        let code = random_link_code(&mut OsRng);
        assert_eq!(code.len(), LINK_CODE_LENGTH);
        assert!(code.bytes().all(|b| LINK_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn link_code_alphabet_excludes_ambiguous_characters() {
        assert_eq!(LINK_CODE_ALPHABET.len(), 58);
        for ambiguous in [b'l', b'I', b'G', b'O'] {
            assert!(!LINK_CODE_ALPHABET.contains(&ambiguous));
        }
    }

    #[tokio::test]
    async fn generation_retries_until_unique() {
        let store = BridgeStore::new(ChannelId(0), None);
        let code = generate_unique_link_code(&store, &mut OsRng)
            .await
            .expect("unique");
        assert_eq!(code.len(), LINK_CODE_LENGTH);
    }

    #[tokio::test]
    async fn five_collisions_exhaust_generation() {
        let store = BridgeStore::new(ChannelId(0), None);
        // A constant generator produces the same code on every attempt; store
        // that code so each attempt collides.
        let mut fixed = StepRng::new(0, 0);
        let colliding = random_link_code(&mut fixed.clone());
        store
            .set_record(LinkSession {
                link_code: colliding,
                owner_user_id: "user-a".to_string(),
                owner_channel_id: ChannelId(0),
                payload: Vec::new(),
                expires_at: unix_now() + 300,
            })
            .await
            .expect("seed");

        assert_eq!(generate_unique_link_code(&store, &mut fixed).await, None);
    }

    #[test]
    fn sdp_with_all_keys_is_valid() {
        assert!(valid_sdp(VALID_SDP));
    }

    #[test]
    fn sdp_missing_keys_is_invalid() {
        assert!(!valid_sdp("v=0\no=alice"));
        assert!(!valid_sdp(""));
    }

    #[test]
    fn candidates_require_all_fields() {
        let complete = Candidate {
            candidate: Some("candidate:1".to_string()),
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".to_string()),
        };
        let partial = Candidate {
            candidate: Some("candidate:1".to_string()),
            sdp_mline_index: None,
            sdp_mid: Some("0".to_string()),
        };
        assert!(valid_candidates(&[complete.clone()]));
        assert!(!valid_candidates(&[complete, partial]));
        assert!(valid_candidates(&[]));
    }

    #[test]
    fn signal_bodies_validate_and_carry_sender() {
        let body = serde_json::json!({ "sdp": VALID_SDP, "candidates": [] }).to_string();
        let reply = build_reply("user-b", body.as_bytes()).expect("reply");
        assert_eq!(reply["client_id"], "user-b");
        assert!(reply.get("sdp").is_some());
    }

    #[test]
    fn invalid_signal_bodies_are_malformed() {
        let body = serde_json::json!({ "sdp": "v=0", "candidates": [] }).to_string();
        let err = build_reply("user-b", body.as_bytes()).expect_err("malformed");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn opaque_bodies_become_peer_sessions() {
        let reply = build_reply("user-b", b"PUBKEY_B").expect("reply");
        assert_eq!(reply["client_id"], "user-b");
        assert_eq!(reply["public_key"], "PUBKEY_B");
    }
}
