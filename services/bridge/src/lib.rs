//! Bridge service.
//!
//! # Purpose
//! Stateless-per-request gateway peers talk to: publishes short-lived link
//! codes carrying session descriptors, forwards one-shot signaling replies,
//! streams server-sent events to connected peers, and bridges unknown
//! destinations onto the bus partition their owner is pinned to.
pub mod api;
pub mod auth;
pub mod channels;
pub mod config;
pub mod consumer;

use api::types::{Delivery, LinkSession};
use bytes::Bytes;
use plover_auth::AuthorityClient;
use plover_common::ChannelId;
use plover_store::Store;
use std::sync::Arc;

pub type BridgeStore = Store<LinkSession>;

#[derive(Clone)]
pub struct AppState {
    pub service_id: String,
    // Bus partition this bridge consumes; inbound route for its users.
    pub channel_id: ChannelId,
    // Route replies through the authority's per-user push channel instead of
    // per-request bridge streams.
    pub unified_push: bool,
    pub relay_topic: String,
    pub push_topic: String,
    pub store: Arc<BridgeStore>,
    pub auth: Arc<auth::BridgeAuth>,
    // Per-link-code waiters for open publish streams.
    pub signals: Arc<channels::ChannelMap<Bytes>>,
    // Per-user channels feeding open message streams.
    pub messages: Arc<channels::ChannelMap<Delivery>>,
    pub bus: Option<Arc<dyn plover_bus::Bus>>,
    pub authority: Option<AuthorityClient>,
}
