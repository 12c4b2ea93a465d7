//! Bus consumer bound to this bridge's own partition.
//!
//! Dispatches relay envelopes to their local waiters: signal replies to the
//! link-code channel of an open publish stream, messages to the per-user
//! stream channel, revokes to waiter teardown. Unrecognized targets are
//! dropped; the user may have disconnected.
use crate::api::types::{BusEnvelope, Delivery};
use crate::AppState;
use bytes::Bytes;

pub async fn handle_bus_envelope(state: &AppState, payload: Bytes) {
    let envelope: BusEnvelope = match serde_json::from_slice(&payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable relay envelope");
            return;
        }
    };

    match envelope {
        BusEnvelope::Signal { link_code, signal } => {
            let frame = match serde_json::to_vec(&signal) {
                Ok(frame) => Bytes::from(frame),
                Err(err) => {
                    tracing::warn!(error = %err, "unencodable signal");
                    return;
                }
            };
            if !state.signals.deliver(&link_code, frame).await {
                tracing::debug!(%link_code, "no waiter for forwarded signal");
            }
        }
        BusEnvelope::Message { client_id, payload } => {
            let delivery: Delivery = match serde_json::from_slice(&payload) {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::warn!(error = %err, "unparseable message delivery");
                    return;
                }
            };
            if !state.messages.deliver(&client_id, delivery).await {
                tracing::debug!(%client_id, "message target not connected");
            }
        }
        BusEnvelope::Revoke { link_code, .. } => {
            state.signals.remove(&link_code);
            state.store.remove_record(&link_code).await;
            tracing::debug!(%link_code, "session revoked by peer bridge");
        }
    }
}
