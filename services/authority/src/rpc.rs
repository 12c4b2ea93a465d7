//! Internal RPC surface for the bridges, plus the push-bus consumer.
use crate::api::{api_internal, api_unauthorized, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router};
use bytes::Bytes;
use plover_auth::client::{PushRequest, PushResponse, VerifyRequest};
use plover_auth::Claims;
use plover_bus::Bus;
use tower_http::trace::TraceLayer;

pub fn build_rpc_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(|| async { StatusCode::OK }))
        .route("/internal/verify", axum::routing::post(verify))
        .route("/internal/push", axum::routing::post(push))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Resolve the minting instance from the token body, fetch its secret, and
// validate. Tokens from sibling instances verify through the shared store.
async fn verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Claims>, ApiError> {
    let issuer = plover_auth::extract_issuer(&body.access_token)
        .map_err(|_| api_unauthorized("malformed token"))?;

    let secret = state
        .store
        .get_secret(&issuer)
        .await
        .map_err(|_| api_unauthorized("unknown issuer"))?;

    let claims = plover_auth::decode(&body.access_token, &secret)
        .map_err(|_| api_unauthorized("token is invalid or expired"))?;

    Ok(Json(claims))
}

// Deliver to the local connection when the target channel is ours, otherwise
// hand the envelope to the bus partition whose owner will.
async fn push(
    State(state): State<AppState>,
    Json(body): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    if body.channel_id == state.channel_id {
        let payload = body
            .message_bytes()
            .map_err(|_| api_internal("malformed push payload"))?;
        let delivered = state.conn_map.push(&body.client_id, &payload).await;
        if !delivered {
            tracing::debug!(client_id = %body.client_id, "push target not connected");
        }
        return Ok(Json(PushResponse { success: true }));
    }

    let Some(bus) = &state.bus else {
        tracing::warn!(channel_id = %body.channel_id, "no route to remote channel");
        return Ok(Json(PushResponse { success: false }));
    };

    let envelope =
        serde_json::to_vec(&body).map_err(|_| api_internal("failed to encode envelope"))?;
    bus.send(&state.push_topic, body.channel_id, Bytes::from(envelope))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "push bus send failed");
            api_internal("push delivery failed")
        })?;

    Ok(Json(PushResponse { success: true }))
}

/// Handle one bus envelope: push the payload into the local connection for
/// its target, dropping envelopes for users no longer connected here.
pub async fn handle_bus_envelope(state: &AppState, payload: Bytes) {
    let request: PushRequest = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable push envelope");
            return;
        }
    };
    let Ok(message) = request.message_bytes() else {
        tracing::warn!(client_id = %request.client_id, "unparseable push payload");
        return;
    };
    if !state.conn_map.push(&request.client_id, &message).await {
        tracing::debug!(client_id = %request.client_id, "bus push target not connected");
    }
}
