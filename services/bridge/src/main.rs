// Plover Bridge
// -------------
// Peer-facing gateway: link-code rendezvous, one-shot signal forwarding, and
// the per-user event stream. Claims one relay partition from the coordinator
// and consumes it so sibling bridges can forward traffic for users connected
// here.
use anyhow::Context;
use bridge::auth::BridgeAuth;
use bridge::channels::ChannelMap;
use bridge::config::BridgeConfig;
use bridge::{api, consumer, AppState, BridgeStore};
use plover_auth::{AuthorityClient, TokenCache};
use plover_bus::{Bus, MemoryBus};
use plover_common::ChannelId;
use plover_coordinator::{CoordinatorClient, HttpRegistry};
use plover_store::{RedisStore, RemoteKv};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = plover_common::telemetry::init("plover-bridge");
    let config = BridgeConfig::from_env_or_yaml()?;

    let remote: Option<Arc<dyn RemoteKv>> = match &config.redis_addr {
        Some(addr) => Some(Arc::new(
            RedisStore::connect(addr)
                .await
                .context("initialize shared storage")?,
        )),
        None => None,
    };

    let coordinator = config
        .coordinator_addr
        .as_deref()
        .map(CoordinatorClient::new);
    let channel_id = match &coordinator {
        Some(client) => {
            let channel = client
                .request_partition(&config.service_id, &config.service_name, &config.relay_topic)
                .await
                .context("claim bus partition")?;
            tracing::info!(%channel, "relay partition claimed");
            channel
        }
        None => ChannelId(0),
    };

    let store = Arc::new(BridgeStore::new(channel_id, remote));
    let store_sweeper = plover_store::spawn_sweeper(store.clone());

    let token_cache = Arc::new(TokenCache::new());
    let cache_sweeper = plover_auth::cache::spawn_sweeper(token_cache.clone());

    let authority = config.authority_addr.as_deref().map(AuthorityClient::new);
    let auth = Arc::new(BridgeAuth::new(
        token_cache,
        authority.clone(),
        store.clone(),
    ));

    let bus: Option<Arc<dyn Bus>> = if config.bus_enabled {
        Some(Arc::new(MemoryBus::new(config.bus_partitions)))
    } else {
        None
    };

    let state = AppState {
        service_id: config.service_id.clone(),
        channel_id,
        unified_push: config.unified_push,
        relay_topic: config.relay_topic.clone(),
        push_topic: config.push_topic.clone(),
        store: store.clone(),
        auth,
        signals: Arc::new(ChannelMap::new()),
        messages: Arc::new(ChannelMap::new()),
        bus: bus.clone(),
        authority,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(bus) = &bus {
        let subscription = bus.subscribe(&config.relay_topic, channel_id).await?;
        let consumer_state = state.clone();
        let consumer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            plover_bus::run_consumer(subscription, consumer_shutdown, move |payload| {
                let state = consumer_state.clone();
                async move {
                    consumer::handle_bus_envelope(&state, payload).await;
                }
            })
            .await;
        });
    }

    let registry = config.registry_addr.as_deref().map(HttpRegistry::new);
    if let Some(registry) = &registry {
        registry
            .register(
                &config.service_id,
                &config.service_name,
                &config.bind_addr.ip().to_string(),
                config.bind_addr.port(),
            )
            .await
            .context("register with service registry")?;
    }

    tokio::spawn(plover_common::telemetry::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    tokio::spawn(watch_signals(shutdown_tx.clone()));

    let app = api::build_router(state);
    let addr = config.bind_addr;
    tracing::info!(%addr, service_id = %config.service_id, %channel_id, "bridge listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await?;

    // Teardown order: partition, registry entry, then a short grace for
    // in-flight stream closes.
    if let Some(client) = &coordinator {
        if let Err(err) = client.release_partition(&config.service_id).await {
            tracing::warn!(error = %err, "partition release failed");
        }
    }
    if let Some(registry) = &registry {
        if let Err(err) = registry.deregister(&config.service_id).await {
            tracing::warn!(error = %err, "registry deregistration failed");
        }
    }
    store_sweeper.abort();
    cache_sweeper.abort();
    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!("bridge stopped");
    Ok(())
}

async fn watch_signals(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
