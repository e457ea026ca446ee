//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use fleet_common::MigrationPhase;
use fleet_dependency::{Context, DependencyError, Manifold, StopSignal, TaskWorker};
use fleet_worker::{FortressError, Guard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::conditions::ApiConnection;
use crate::names;

/// Manifold driving the migration fortress from the reported migration phase.
///
/// While a migration is active the fortress is locked down, which waits for
/// every housed worker to leave. Once the phase is inactive again the
/// fortress is unlocked.
pub fn migration_master_manifold(name: &str) -> Manifold {
    let worker_name = name.to_owned();
    Manifold::new(name, move |ctx: Context| {
        let worker_name = worker_name.clone();
        async move {
            let connection: ApiConnection = ctx.get(names::API_CALLER)?;
            let guard: Guard = ctx.get(names::MIGRATION_FORTRESS)?;
            let phase = connection.migration_phase();
            Ok(TaskWorker::spawn(worker_name, move |stop| {
                run_master(guard, phase, stop)
            }))
        }
    })
    .with_inputs([names::AGENT, names::API_CALLER, names::MIGRATION_FORTRESS])
}

async fn run_master(
    guard: Guard,
    mut phase: watch::Receiver<MigrationPhase>,
    stop: StopSignal,
) -> anyhow::Result<()> {
    loop {
        let current = *phase.borrow_and_update();
        if current.is_inactive() {
            guard.unlock();
        } else {
            let abort = {
                let stop = stop.clone();
                let mut phase = phase.clone();
                async move {
                    tokio::select! {
                        _ = stop.stopped() => {}
                        _ = phase.wait_for(MigrationPhase::is_inactive) => {}
                    }
                }
            };
            info!(phase = ?current, "locking down for migration");
            match guard.lockdown(abort).await {
                Ok(()) => info!(phase = ?current, "migration fortress locked"),
                Err(FortressError::Aborted) => debug!("migration lockdown abandoned"),
                Err(FortressError::Shutdown) => {
                    warn!("migration fortress closed during lockdown");
                    return Err(DependencyError::Bounce.into());
                }
            }
        }

        tokio::select! {
            _ = stop.stopped() => return Ok(()),
            changed = phase.changed() => {
                if changed.is_err() {
                    stop.stopped().await;
                    return Ok(());
                }
            }
        }
    }
}
