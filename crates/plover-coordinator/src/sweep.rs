//! Leader-only failure detection sweep.
//!
//! Every minute the elected leader enumerates recorded assignments, asks the
//! registry which instances are still passing, and releases everything
//! recorded but not reported live. Assignments younger than [`SWEEP_MIN_AGE`]
//! are spared so a just-registered service that the registry has not caught
//! up with yet is not torn down.
use crate::registry::ServiceRegistry;
use crate::{AssignmentStore, CoordinatorError};
use plover_common::unix_now;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const SWEEP_MIN_AGE: i64 = 60;

/// One sweep pass. Returns how many assignments were released.
pub async fn sweep_once(
    assignments: &dyn AssignmentStore,
    registry: &dyn ServiceRegistry,
) -> Result<usize, CoordinatorError> {
    let recorded = assignments.list_service_ids().await?;
    let names = assignments.list_service_names().await?;

    let mut live: HashSet<String> = HashSet::new();
    let mut unreachable_names: HashSet<String> = HashSet::new();
    for name in names {
        match registry.live_instances(&name).await {
            Ok(ids) => live.extend(ids),
            Err(err) => {
                // A registry hiccup must not read as mass death; instances of
                // this name are not swept this round.
                tracing::warn!(service_name = %name, error = %err, "registry query failed");
                unreachable_names.insert(name);
            }
        }
    }

    let now = unix_now();
    let mut released = 0;
    for service_id in recorded {
        if live.contains(&service_id) {
            continue;
        }
        match assignments.get_assignment(&service_id).await? {
            Some(assignment) if unreachable_names.contains(&assignment.service_name) => {}
            Some(assignment) if assignment.age_secs(now) < SWEEP_MIN_AGE => {
                tracing::debug!(service_id, "assignment too young to sweep");
            }
            Some(_) => {
                assignments.release_partition(&service_id).await?;
                tracing::info!(service_id, "dead assignment released");
                released += 1;
            }
            None => {}
        }
    }
    Ok(released)
}

/// Periodic sweep loop; call only after winning leadership.
pub async fn run_failure_sweep(
    assignments: &dyn AssignmentStore,
    registry: &dyn ServiceRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("failure sweep stopping");
                    return;
                }
            }
            _ = ticker.tick() => {
                match sweep_once(assignments, registry).await {
                    Ok(released) if released > 0 => {
                        tracing::info!(released, "failure sweep pass complete");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "failure sweep pass failed"),
                }
            }
        }
    }
}
