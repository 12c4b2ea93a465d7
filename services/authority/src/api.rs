//! Client-facing surface: WebSocket mint, refresh, transfer.
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use plover_auth::client::{AuthorizationGrant, ClientMessage, MESSAGE_KIND_AUTHORIZATION};
use plover_common::unix_now;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn api_unauthorized(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::UNAUTHORIZED,
        body: ErrorResponse {
            code: "unauthorized".to_string(),
            message: message.to_string(),
        },
    }
}

pub fn api_internal(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            code: "internal".to_string(),
            message: message.to_string(),
        },
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub refresh_token: String,
    pub access_token: String,
    pub expires_at: i64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/initialize", axum::routing::get(initialize))
        .route("/refresh", axum::routing::post(refresh))
        .route("/transfer", axum::routing::post(transfer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

// Mint a fresh identity and hand the tokens over the upgraded socket. The
// refresh entry lives only as long as this connection unless transferred.
async fn initialize(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<axum::response::Response, ApiError> {
    let secret = state
        .store
        .get_secret(&state.service_id)
        .await
        .map_err(|_| api_internal("signing secret unavailable"))?;

    let user_id = uuid::Uuid::new_v4().to_string();
    let iat = unix_now();
    let exp = iat + state.bearer_ttl.as_secs() as i64;

    let refresh_token = plover_auth::mint_refresh(
        &state.service_id,
        &user_id,
        state.channel_id,
        &secret,
        iat,
    )
    .map_err(|_| api_internal("failed to mint refresh token"))?;
    let access_token = plover_auth::mint_bearer(
        &state.service_id,
        &user_id,
        state.channel_id,
        &secret,
        iat,
        exp,
    )
    .map_err(|_| api_internal("failed to mint access token"))?;

    state
        .store
        .save_refresh(&refresh_token, &user_id, state.refresh_ttl)
        .await;
    metrics::counter!("authority_tokens_minted_total").increment(1);

    Ok(ws.on_upgrade(move |socket| {
        client_session(state, socket, user_id, refresh_token, access_token, exp)
    }))
}

// Own the socket for the life of the session: register the connection, push
// the authorization grant, drain inbound frames until close, then clean up.
async fn client_session(
    state: AppState,
    socket: WebSocket,
    user_id: String,
    refresh_token: String,
    access_token: String,
    expires_at: i64,
) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut receiver) = mpsc::channel::<Message>(16);
    state.conn_map.set(&user_id, sender.clone());
    tracing::info!(%user_id, "client connected");

    let grant = ClientMessage::new(
        MESSAGE_KIND_AUTHORIZATION,
        AuthorizationGrant {
            refresh_token: refresh_token.clone(),
            access_token,
            expires_at,
        },
    );
    let frame = serde_json::to_string(&grant).unwrap_or_default();
    let _ = sender.send(Message::Text(frame)).await;

    // One writer task per connection; producers go through the conn map.
    let writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.conn_map.remove(&user_id);
    state.store.delete_refresh(&refresh_token).await;
    writer.abort();
    tracing::info!(%user_id, "client disconnected");
}

fn refresh_header(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| api_unauthorized("missing refresh token"))
}

// New bearer from a live refresh token; the refresh token is not rotated.
async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, ApiError> {
    let refresh_token = refresh_header(&headers)?;
    let Some(user_id) = state.store.refresh_user(refresh_token).await else {
        return Err(api_unauthorized("refresh token is invalid or expired"));
    };

    let secret = state
        .store
        .get_secret(&state.service_id)
        .await
        .map_err(|_| api_internal("signing secret unavailable"))?;

    let iat = unix_now();
    let exp = iat + state.bearer_ttl.as_secs() as i64;
    let access_token = plover_auth::mint_bearer(
        &state.service_id,
        &user_id,
        state.channel_id,
        &secret,
        iat,
        exp,
    )
    .map_err(|_| api_internal("failed to mint access token"))?;

    Ok(Json(RefreshResponse {
        access_token,
        expires_at: exp,
    }))
}

// Session handover: retire the presented refresh token and mint a new pair.
async fn transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TransferResponse>, ApiError> {
    let old_refresh = refresh_header(&headers)?;
    let Some(user_id) = state.store.refresh_user(old_refresh).await else {
        return Err(api_unauthorized("refresh token is invalid or expired"));
    };

    state.store.delete_refresh(old_refresh).await;

    let secret = state
        .store
        .get_secret(&state.service_id)
        .await
        .map_err(|_| api_internal("signing secret unavailable"))?;

    let iat = unix_now();
    let exp = iat + state.bearer_ttl.as_secs() as i64;
    let refresh_token = plover_auth::mint_refresh(
        &state.service_id,
        &user_id,
        state.channel_id,
        &secret,
        iat,
    )
    .map_err(|_| api_internal("failed to mint refresh token"))?;
    let access_token = plover_auth::mint_bearer(
        &state.service_id,
        &user_id,
        state.channel_id,
        &secret,
        iat,
        exp,
    )
    .map_err(|_| api_internal("failed to mint access token"))?;

    state
        .store
        .save_refresh(&refresh_token, &user_id, state.refresh_ttl)
        .await;

    Ok(Json(TransferResponse {
        refresh_token,
        access_token,
        expires_at: exp,
    }))
}
