//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;

use fleet_common::{Life, MigrationPhase, Topology};
use fleet_dependency::{Context, DependencyError, Manifold, Outputs, TaskWorker, Worker};
use fleet_worker::{
    flag_manifold, fortress_manifold, gate_flag_manifold, gate_manifold, Gate, Housing,
    Unlocker, Waiter,
};
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::collaborators::{Agent, Collaborators, Environ, IdleCollaborators, SharedClock, WallClock};
use crate::conditions::{ApiConnection, Conditions};
use crate::migration::migration_master_manifold;
use crate::names::*;

/// Manifolds keyed by name, in declaration order.
pub type Manifolds = IndexMap<String, Manifold>;

/// Everything a topology needs from the hosting process.
#[derive(Clone)]
pub struct ManifoldsConfig {
    pub agent: Agent,
    pub clock: SharedClock,
    pub connection: ApiConnection,
    /// Latch opened once the model upgrade has run; survives restarts.
    pub upgrade_gate: Gate,
    pub collaborators: Arc<dyn Collaborators>,
}

impl ManifoldsConfig {
    /// Idle collaborators, the wall clock and an already open upgrade gate.
    pub fn new(agent: Agent, conditions: &Conditions) -> Self {
        Self {
            agent,
            clock: Arc::new(WallClock),
            connection: conditions.connection(),
            upgrade_gate: Gate::unlocked(),
            collaborators: Arc::new(IdleCollaborators),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_upgrade_gate(mut self, gate: Gate) -> Self {
        self.upgrade_gate = gate;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Arc<dyn Collaborators>) -> Self {
        self.collaborators = collaborators;
        self
    }
}

/// Manifold table for the selected topology.
pub fn manifolds(topology: Topology, config: &ManifoldsConfig) -> Manifolds {
    match topology {
        Topology::Cluster => cluster_manifolds(config),
        Topology::Standalone => standalone_manifolds(config),
    }
}

/// Machine-based model: environ tracker, provisioners, firewaller and poller.
pub fn cluster_manifolds(config: &ManifoldsConfig) -> Manifolds {
    let mut manifolds = common_manifolds(config, ENVIRON_TRACKER);
    extend(
        &mut manifolds,
        [
            tracker_manifold(ENVIRON_TRACKER, "cluster"),
            model_upgrader_manifold(config, &[ENVIRON_TRACKER])
                .decorated(&Housing::new().with_flags([VALID_CREDENTIAL_FLAG])),
            collaborator(config, UNDERTAKER, &[AGENT, API_CALLER, CLOCK, ENVIRON_TRACKER])
                .decorated(&undertaker_housing()),
            collaborator(config, APPLICATION_SCALER, &[AGENT, API_CALLER])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, METRIC_WORKER, &[AGENT, API_CALLER])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, UNIT_ASSIGNER, &[AGENT, API_CALLER])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, STORAGE_PROVISIONER, &[AGENT, API_CALLER, CLOCK, ENVIRON_TRACKER])
                .decorated(&not_migrating(&RUN_FLAGS)),
        ],
    );
    for name in [
        COMPUTE_PROVISIONER,
        FIREWALLER,
        INSTANCE_POLLER,
        MACHINE_UNDERTAKER,
    ] {
        let manifold = collaborator(config, name, &[AGENT, API_CALLER, CLOCK, ENVIRON_TRACKER])
            .decorated(&not_migrating(&RUN_FLAGS).with_flags([VALID_CREDENTIAL_FLAG]));
        extend(&mut manifolds, [manifold]);
    }
    manifolds
}

/// Container-orchestrated model: broker tracker and container provisioners.
pub fn standalone_manifolds(config: &ManifoldsConfig) -> Manifolds {
    let mut manifolds = common_manifolds(config, CAAS_BROKER_TRACKER);
    extend(
        &mut manifolds,
        [
            tracker_manifold(CAAS_BROKER_TRACKER, "caas"),
            model_upgrader_manifold(config, &[]),
            collaborator(config, UNDERTAKER, &[AGENT, API_CALLER, CLOCK, CAAS_BROKER_TRACKER])
                .decorated(&undertaker_housing()),
        ],
    );
    for name in [
        CAAS_FIREWALLER,
        CAAS_OPERATOR_PROVISIONER,
        CAAS_UNIT_PROVISIONER,
    ] {
        let manifold = collaborator(config, name, &[AGENT, API_CALLER, CAAS_BROKER_TRACKER])
            .decorated(&not_migrating(&RUN_FLAGS));
        extend(&mut manifolds, [manifold]);
    }
    manifolds
}

/// Flags every model worker runs under: responsible, model not dead, upgraded.
const RUN_FLAGS: [&str; 3] = [IS_RESPONSIBLE_FLAG, NOT_DEAD_FLAG, MODEL_UPGRADED_FLAG];

/// Run flags plus the migration flag, with the worker housed in the fortress.
fn not_migrating(flags: &[&str]) -> Housing {
    Housing::new()
        .with_flags(flags.iter().copied())
        .with_flags([MIGRATION_INACTIVE_FLAG])
        .occupying(MIGRATION_FORTRESS)
}

fn undertaker_housing() -> Housing {
    Housing::new().with_flags([
        IS_RESPONSIBLE_FLAG,
        NOT_ALIVE_FLAG,
        MODEL_UPGRADED_FLAG,
        VALID_CREDENTIAL_FLAG,
    ])
}

trait Decorated {
    fn decorated(self, housing: &Housing) -> Manifold;
}

impl Decorated for Manifold {
    fn decorated(self, housing: &Housing) -> Manifold {
        housing.decorate(self)
    }
}

fn extend(manifolds: &mut Manifolds, items: impl IntoIterator<Item = Manifold>) {
    for manifold in items {
        manifolds.insert(manifold.name().to_owned(), manifold);
    }
}

fn common_manifolds(config: &ManifoldsConfig, tracker: &str) -> Manifolds {
    let mut manifolds = Manifolds::new();
    let housed_run = Housing::new().with_flags(RUN_FLAGS);
    extend(
        &mut manifolds,
        [
            agent_manifold(config.agent.clone()),
            clock_manifold(Arc::clone(&config.clock)),
            api_caller_manifold(config.connection.clone()),
            collaborator(config, API_CONFIG_WATCHER, &[AGENT]),
            condition_flag(
                IS_RESPONSIBLE_FLAG,
                &[AGENT, API_CALLER, CLOCK],
                |api| api.responsible(),
                |responsible: &bool| *responsible,
            ),
            condition_flag(
                NOT_DEAD_FLAG,
                &[AGENT, API_CALLER],
                |api| api.life(),
                |life: &Life| *life != Life::Dead,
            ),
            condition_flag(
                NOT_ALIVE_FLAG,
                &[AGENT, API_CALLER],
                |api| api.life(),
                |life: &Life| *life != Life::Alive,
            ),
            condition_flag(
                VALID_CREDENTIAL_FLAG,
                &[AGENT, API_CALLER],
                |api| api.credential_valid(),
                |valid: &bool| *valid,
            ),
            gate_manifold(MODEL_UPGRADE_GATE, config.upgrade_gate.clone()),
            gate_flag_manifold(MODEL_UPGRADED_FLAG, MODEL_UPGRADE_GATE),
            fortress_manifold(MIGRATION_FORTRESS).decorated(&housed_run),
            condition_flag(
                MIGRATION_INACTIVE_FLAG,
                &[AGENT, API_CALLER],
                |api| api.migration_phase(),
                MigrationPhase::is_inactive,
            )
            .decorated(&housed_run),
            migration_master_manifold(MIGRATION_MASTER).decorated(&housed_run),
            collaborator(config, LOG_FORWARDER, &[AGENT, API_CALLER])
                .decorated(&Housing::new().with_flags([IS_RESPONSIBLE_FLAG, NOT_DEAD_FLAG])),
            collaborator(config, CHARM_REVISION_UPDATER, &[AGENT, API_CALLER, CLOCK])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, REMOTE_RELATIONS, &[AGENT, API_CALLER])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, STATE_CLEANER, &[AGENT, API_CALLER])
                .decorated(&not_migrating(&[IS_RESPONSIBLE_FLAG, MODEL_UPGRADED_FLAG])),
            collaborator(config, ACTION_PRUNER, &[AGENT, API_CALLER, CLOCK, tracker])
                .decorated(&not_migrating(&RUN_FLAGS)),
            collaborator(config, STATUS_HISTORY_PRUNER, &[AGENT, API_CALLER, CLOCK, tracker])
                .decorated(&not_migrating(&RUN_FLAGS)),
        ],
    );
    manifolds
}

/// Idle worker publishing a fixed output.
fn constant_manifold(name: &str, inputs: &[&str], outputs: Outputs) -> Manifold {
    let worker_name = name.to_owned();
    Manifold::new(name, move |_ctx: Context| {
        let worker_name = worker_name.clone();
        async move {
            Ok(TaskWorker::spawn(worker_name, |stop| async move {
                stop.stopped().await;
                Ok(())
            }))
        }
    })
    .with_inputs(inputs.iter().copied())
    .with_output_fn(Arc::new(move |_worker: &dyn Worker| {
        Ok::<_, anyhow::Error>(outputs.clone())
    }))
}

fn agent_manifold(agent: Agent) -> Manifold {
    constant_manifold(AGENT, &[], Outputs::new().with(agent))
}

fn clock_manifold(clock: SharedClock) -> Manifold {
    constant_manifold(CLOCK, &[], Outputs::new().with(clock))
}

fn api_caller_manifold(connection: ApiConnection) -> Manifold {
    let manifold = constant_manifold(API_CALLER, &[AGENT], Outputs::new().with(connection));
    let start = manifold.start_fn();
    manifold.with_start(Arc::new(move |ctx: Context| {
        let start = Arc::clone(&start);
        async move {
            let agent: Agent = ctx.get(AGENT)?;
            info!(agent = %agent.tag, model = %agent.model, "connected to controller");
            start(ctx).await
        }
        .boxed()
    }))
}

/// Flag over one of the conditions carried by the api connection.
fn condition_flag<T, P>(
    name: &str,
    inputs: &[&str],
    select: fn(&ApiConnection) -> watch::Receiver<T>,
    predicate: P,
) -> Manifold
where
    T: Send + Sync + 'static,
    P: Fn(&T) -> bool + Clone + Send + Sync + 'static,
{
    flag_manifold(
        name,
        inputs,
        Arc::new(move |ctx: &Context| -> anyhow::Result<watch::Receiver<T>> {
            let api: ApiConnection = ctx.get(API_CALLER)?;
            Ok(select(&api))
        }),
        predicate,
    )
}

/// Worker that tracks the provider environment of the model.
struct TrackerWorker {
    environ: Environ,
    task: TaskWorker,
}

#[async_trait::async_trait]
impl Worker for TrackerWorker {
    fn kill(&self) {
        self.task.kill();
    }

    async fn wait(&self) -> anyhow::Result<()> {
        self.task.wait().await
    }
}

fn tracker_manifold(name: &str, kind: &'static str) -> Manifold {
    let worker_name = name.to_owned();
    Manifold::new(name, move |ctx: Context| {
        let worker_name = worker_name.clone();
        async move {
            let agent: Agent = ctx.get(AGENT)?;
            let environ = Environ {
                kind: kind.to_owned(),
                model: agent.model,
            };
            debug!(manifold = %worker_name, kind, "tracking environ");
            let task = TaskWorker::spawn(worker_name, |stop| async move {
                stop.stopped().await;
                Ok(())
            });
            Ok(TrackerWorker { environ, task })
        }
    })
    .with_inputs([AGENT, API_CALLER])
    .with_output(|worker: &TrackerWorker| Outputs::new().with(worker.environ.clone()))
    .decorated(&Housing::new().with_flags([IS_RESPONSIBLE_FLAG]))
}

/// Runs the upgrade steps once, opens the upgrade gate and uninstalls itself.
fn model_upgrader_manifold(config: &ManifoldsConfig, extra: &[&str]) -> Manifold {
    let collaborators = Arc::clone(&config.collaborators);
    let mut inputs = vec![AGENT, API_CALLER, MODEL_UPGRADE_GATE];
    inputs.extend_from_slice(extra);
    Manifold::new(MODEL_UPGRADER, move |ctx: Context| {
        let collaborators = Arc::clone(&collaborators);
        async move {
            let waiter: Waiter = ctx.get(MODEL_UPGRADE_GATE)?;
            if waiter.is_unlocked() {
                debug!("model already upgraded");
                return Err(DependencyError::Uninstall.into());
            }
            let unlocker: Unlocker = ctx.get(MODEL_UPGRADE_GATE)?;
            Ok(TaskWorker::spawn(MODEL_UPGRADER, move |stop| async move {
                tokio::select! {
                    _ = stop.stopped() => return Ok(()),
                    upgraded = collaborators.upgrade(&ctx) => upgraded?,
                }
                unlocker.unlock();
                info!("model upgrade complete");
                Err(DependencyError::Uninstall.into())
            }))
        }
    })
    .with_inputs(inputs)
}

/// Manifold whose worker comes from the collaborator factory.
fn collaborator(config: &ManifoldsConfig, name: &str, inputs: &[&str]) -> Manifold {
    let collaborators = Arc::clone(&config.collaborators);
    Manifold::from_start(
        name,
        Arc::new(move |ctx: Context| {
            let collaborators = Arc::clone(&collaborators);
            async move {
                let name = ctx.name().to_owned();
                collaborators.start(&name, &ctx).await
            }
            .boxed()
        }),
    )
    .with_inputs(inputs.iter().copied())
}
