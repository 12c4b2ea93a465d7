//! Token authority service.
//!
//! # Purpose
//! Mints bearer and refresh tokens bound to a per-instance secret, keeps one
//! WebSocket per authenticated user for server-initiated pushes, and exposes
//! the verify/push RPC surface the bridges call. Pushes for users owned by a
//! different instance travel over the bus partition their token was minted
//! against.
pub mod api;
pub mod config;
pub mod conn_map;
pub mod rpc;

use plover_common::ChannelId;
use plover_store::{NullRecord, Store};
use std::sync::Arc;
use std::time::Duration;

pub type AuthorityStore = Store<NullRecord>;

#[derive(Clone)]
pub struct AppState {
    // Instance identity; doubles as the token issuer.
    pub service_id: String,
    pub channel_id: ChannelId,
    pub bearer_ttl: Duration,
    pub refresh_ttl: Duration,
    pub store: Arc<AuthorityStore>,
    pub conn_map: Arc<conn_map::ConnMap>,
    pub bus: Option<Arc<dyn plover_bus::Bus>>,
    pub push_topic: String,
}
