// Plover Partition Coordinator
// ----------------------------
// Assigns each registering bridge/authority instance exclusive ownership of
// one bus partition and reclaims partitions from instances the registry stops
// reporting live. Clustered mode keeps assignments in the shared coordination
// store behind a distributed read/write lock; a leader elected over
// ephemeral-sequential nodes runs the failure sweep.
use coordinator::api::{self, AppState};
use coordinator::config;
use plover_bus::MemoryBus;
use plover_coordinator::election::Election;
use plover_coordinator::shared::SharedAssignments;
use plover_coordinator::sweep::run_failure_sweep;
use plover_coordinator::{
    AssignmentStore, CoordinationStore, HttpRegistry, LocalAssignments, MemoryCoordinationStore,
    ServiceRegistry,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = plover_common::telemetry::init("plover-coordinator");
    let config = config::CoordinatorConfig::from_env_or_yaml()?;

    let bus = Arc::new(MemoryBus::new(config.bus_partitions));

    let coordination = Arc::new(MemoryCoordinationStore::new());
    let assignments: Arc<dyn AssignmentStore> = if config.clustered {
        Arc::new(SharedAssignments::new(coordination.clone(), bus.clone(), &config.base_path).await?)
    } else {
        Arc::new(LocalAssignments::new(bus.clone()))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Only the elected leader sweeps; every instance serves assignment RPCs.
    if let Some(registry_addr) = config.registry_addr.clone() {
        let registry: Arc<dyn ServiceRegistry> = Arc::new(HttpRegistry::new(&registry_addr));
        let sweep_assignments = assignments.clone();
        let sweep_shutdown = shutdown_rx.clone();
        let election_store = coordination.clone();
        let election_path = format!("{}/leader", config.base_path);
        tokio::spawn(async move {
            let session = match election_store.create_session().await {
                Ok(session) => session,
                Err(err) => {
                    tracing::error!(error = %err, "election session failed");
                    return;
                }
            };
            let election = match Election::join(election_store, &election_path, session).await {
                Ok(election) => election,
                Err(err) => {
                    tracing::error!(error = %err, "election join failed");
                    return;
                }
            };
            if let Err(err) = election.wait_leadership().await {
                tracing::error!(error = %err, "leadership wait failed");
                return;
            }
            run_failure_sweep(sweep_assignments.as_ref(), registry.as_ref(), sweep_shutdown).await;
        });
    }

    tokio::spawn(plover_common::telemetry::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let app = api::build_router(AppState { assignments });

    let addr = config.bind_addr;
    tracing::info!(%addr, service_id = %config.service_id, "coordinator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
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
