// Plover Token Authority
// ----------------------
// Mints bearer+refresh tokens against a per-instance secret, holds one
// WebSocket per authenticated user for server pushes, and answers the
// verify/push RPCs the bridges call. The instance claims a bus partition from
// the coordinator so pushes for its users can be routed from anywhere.
use anyhow::Context;
use authority::config::AuthorityConfig;
use authority::conn_map::ConnMap;
use authority::{api, rpc, AppState, AuthorityStore};
use plover_bus::{Bus, MemoryBus};
use plover_common::ChannelId;
use plover_coordinator::{CoordinatorClient, HttpRegistry};
use plover_store::{RedisStore, RemoteKv};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = plover_common::telemetry::init("plover-authority");
    let config = AuthorityConfig::from_env_or_yaml()?;

    // Fatal if the secret cannot be generated; every token depends on it.
    let mut secret = vec![0u8; 32];
    OsRng
        .try_fill_bytes(&mut secret)
        .context("generate instance secret")?;

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
                .request_partition(&config.service_id, &config.service_name, &config.push_topic)
                .await
                .context("claim bus partition")?;
            tracing::info!(%channel, "bus partition claimed");
            channel
        }
        None => ChannelId(0),
    };

    let store = Arc::new(AuthorityStore::new(channel_id, remote));
    store
        .put_secret(&config.service_id, &secret)
        .await
        .context("publish instance secret")?;
    let sweeper = plover_store::spawn_sweeper(store.clone());

    let bus: Option<Arc<dyn Bus>> = if config.bus_enabled {
        Some(Arc::new(MemoryBus::new(config.bus_partitions)))
    } else {
        None
    };

    let state = AppState {
        service_id: config.service_id.clone(),
        channel_id,
        bearer_ttl: config.bearer_ttl,
        refresh_ttl: config.refresh_ttl,
        store: store.clone(),
        conn_map: Arc::new(ConnMap::new()),
        bus: bus.clone(),
        push_topic: config.push_topic.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(bus) = &bus {
        let subscription = bus.subscribe(&config.push_topic, channel_id).await?;
        let consumer_state = state.clone();
        let consumer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            plover_bus::run_consumer(subscription, consumer_shutdown, move |payload| {
                let state = consumer_state.clone();
                async move {
                    rpc::handle_bus_envelope(&state, payload).await;
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

    let client_listener = TcpListener::bind(config.bind_addr).await?;
    let rpc_listener = TcpListener::bind(config.rpc_bind).await?;
    tracing::info!(
        client = %config.bind_addr,
        rpc = %config.rpc_bind,
        service_id = %config.service_id,
        "authority listening"
    );

    let client_server = tokio::spawn(serve(
        client_listener,
        api::build_router(state.clone()),
        shutdown_rx.clone(),
    ));
    let rpc_server = tokio::spawn(serve(
        rpc_listener,
        rpc::build_rpc_router(state.clone()),
        shutdown_rx.clone(),
    ));
    let _ = tokio::try_join!(client_server, rpc_server)?;

    // Teardown order: secret, partition, registry entry, then a short grace
    // for in-flight deliveries.
    if let Err(err) = store.delete_secret(&config.service_id).await {
        tracing::warn!(error = %err, "secret cleanup failed");
    }
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
    sweeper.abort();
    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!("authority stopped");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
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
