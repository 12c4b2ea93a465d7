//! Consumer pump: drain one partition subscription until shutdown.
use crate::BusSubscription;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Bound on a single delivery into a local channel; a receiver that stalls
/// longer than this loses that one message.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive `handle` for every message on the subscription. Returns when the
/// shutdown signal flips or the partition closes.
pub async fn run_consumer<F, Fut>(
    mut subscription: BusSubscription,
    mut shutdown: watch::Receiver<bool>,
    handle: F,
) where
    F: Fn(Bytes) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("bus consumer stopping");
                    return;
                }
            }
            message = subscription.recv() => {
                match message {
                    Some(payload) => handle(payload).await,
                    None => {
                        tracing::info!("bus partition closed");
                        return;
                    }
                }
            }
        }
    }
}

/// Write one payload into a local delivery channel, dropping it with a log
/// line if the receiver does not drain within [`DELIVERY_TIMEOUT`].
pub async fn deliver(sender: &mpsc::Sender<Bytes>, payload: Bytes) -> bool {
    match tokio::time::timeout(DELIVERY_TIMEOUT, sender.send(payload)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            tracing::debug!("delivery channel closed");
            false
        }
        Err(_) => {
            tracing::warn!("delivery channel timeout, dropping message");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bus, MemoryBus};
    use plover_common::ChannelId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn consumer_handles_messages_until_shutdown() {
        let bus = MemoryBus::new(1);
        let subscription = bus.subscribe("relay", ChannelId(0)).await.expect("sub");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let pump = tokio::spawn(run_consumer(subscription, shutdown_rx, move |_payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        bus.send("relay", ChannelId(0), Bytes::from_static(b"one"))
            .await
            .expect("send");
        bus.send("relay", ChannelId(0), Bytes::from_static(b"two"))
            .await
            .expect("send");

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("signal");
        pump.await.expect("join");

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deliver_reports_closed_channel() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        assert!(!deliver(&sender, Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn deliver_succeeds_with_live_receiver() {
        let (sender, mut receiver) = mpsc::channel(1);
        assert!(deliver(&sender, Bytes::from_static(b"x")).await);
        assert_eq!(receiver.recv().await, Some(Bytes::from_static(b"x")));
    }
}
