//! Relay surface: the per-user event stream and directed messages.
use crate::api::types::{BusEnvelope, Delivery, MessageData, EVENT_CONNECTED, EVENT_MESSAGE};
use crate::api::{api_no_route, api_upstream, ApiError};
use crate::auth::AuthClaims;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use plover_auth::client::{ClientMessage, PushRequest, MESSAGE_KIND_RELAY};
use plover_bus::Bus;
use plover_common::unix_now;
use std::convert::Infallible;
use std::task::Poll;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

// Removes the directory entry and the local channel when the stream ends,
// however it ends.
struct StreamGuard {
    state: AppState,
    user_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.messages.remove(&self.user_id);
        let store = self.state.store.clone();
        let user_id = self.user_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                store.remove_client_channel(&user_id).await;
            });
        }
        tracing::info!(user_id = %self.user_id, "message stream closed");
    }
}

/// Open the caller's inbound event stream. Registers the user in the shared
/// channel directory for the remaining token lifetime, greets with a
/// `connected` event, then relays deliveries until the peer disconnects.
pub async fn listen_messages(
    State(state): State<AppState>,
    claims: AuthClaims,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = claims.0.user_id.clone();
    let session_ttl = Duration::from_secs((claims.0.expires_at() - unix_now()).max(0) as u64);
    state.store.set_client_channel(&user_id, session_ttl).await;

    // Unified mode leaves delivery to the authority's push channel; the
    // stream itself is the user's presence signal.
    let receiver = (!state.unified_push).then(|| state.messages.add(&user_id));
    let guard = StreamGuard {
        state: state.clone(),
        user_id: user_id.clone(),
    };
    tracing::info!(%user_id, "message stream opened");

    let greeting = stream::once(async { Ok(Event::default().event(EVENT_CONNECTED)) });
    let tail: BoxStream<'static, Result<Event, Infallible>> = match receiver {
        Some(receiver) => ReceiverStream::new(receiver)
            .map(move |delivery| {
                let _held = &guard;
                Ok(Event::default().event(delivery.kind).data(delivery.data))
            })
            .boxed(),
        None => stream::poll_fn(move |_| {
            let _held = &guard;
            Poll::Pending
        })
        .boxed(),
    };

    Ok(Sse::new(greeting.chain(tail)).keep_alive(KeepAlive::default()))
}

/// Deliver a message to a user: locally when this bridge owns the stream,
/// over the bus partition recorded in the shared directory otherwise.
pub async fn send_message(
    State(state): State<AppState>,
    claims: AuthClaims,
    Path(target_user_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let data = MessageData {
        sender_id: claims.0.user_id.clone(),
        message: String::from_utf8_lossy(&body).into_owned(),
    };

    if state.unified_push {
        return send_unified(&state, &target_user_id, &data).await;
    }

    let delivery = Delivery {
        kind: EVENT_MESSAGE.to_string(),
        data: serde_json::to_string(&data).map_err(|_| api_upstream("failed to encode message"))?,
    };

    if state.messages.deliver(&target_user_id, delivery.clone()).await {
        metrics::counter!("bridge_messages_relayed_total").increment(1);
        return Ok(StatusCode::OK);
    }

    let Some(bus) = &state.bus else {
        return Err(api_no_route("target user not reachable"));
    };
    let Some(channel_id) = state.store.client_channel(&target_user_id).await else {
        return Err(api_no_route("target user not found"));
    };

    let payload = serde_json::to_vec(&delivery)
        .map_err(|_| api_upstream("failed to encode delivery"))?;
    let envelope = BusEnvelope::Message {
        client_id: target_user_id.clone(),
        payload,
    };
    let frame =
        serde_json::to_vec(&envelope).map_err(|_| api_upstream("failed to encode envelope"))?;
    bus.send(&state.relay_topic, channel_id, Bytes::from(frame))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "relay bus send failed");
            api_upstream("failed to relay message")
        })?;

    metrics::counter!("bridge_messages_relayed_total").increment(1);
    Ok(StatusCode::OK)
}

async fn send_unified(
    state: &AppState,
    target_user_id: &str,
    data: &MessageData,
) -> Result<StatusCode, ApiError> {
    let Some(channel_id) = state.store.client_channel(target_user_id).await else {
        return Err(api_no_route("target user not found"));
    };

    let message = ClientMessage::new(MESSAGE_KIND_RELAY, data);
    let message_bytes =
        serde_json::to_vec(&message).map_err(|_| api_upstream("failed to encode message"))?;

    if let Some(bus) = &state.bus {
        let envelope = PushRequest::new(channel_id, target_user_id, &message_bytes);
        let payload = serde_json::to_vec(&envelope)
            .map_err(|_| api_upstream("failed to encode envelope"))?;
        bus.send(&state.push_topic, channel_id, Bytes::from(payload))
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "push bus send failed");
                api_upstream("failed to relay message")
            })?;
        return Ok(StatusCode::OK);
    }

    if let Some(authority) = &state.authority {
        authority
            .push(channel_id, target_user_id, &message_bytes)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "authority push failed");
                api_upstream("failed to relay message")
            })?;
        return Ok(StatusCode::OK);
    }

    Err(api_no_route("no delivery path to target user"))
}
