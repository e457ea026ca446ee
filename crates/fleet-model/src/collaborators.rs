//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::AgentConfig;
use fleet_dependency::{Context, TaskWorker, Worker};
use tracing::{debug, info};

/// Identity of the hosting agent, exposed by the agent manifold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub tag: String,
    pub model: String,
}

impl From<&AgentConfig> for Agent {
    fn from(config: &AgentConfig) -> Self {
        Self {
            tag: config.tag.clone(),
            model: config.model.clone(),
        }
    }
}

/// Time source shared by workers through the clock manifold.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Provider environment handle exposed by the environ and broker trackers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environ {
    pub kind: String,
    pub model: String,
}

/// Factory for the workers a topology treats as opaque.
///
/// The topology owns wiring and run conditions; implementations only decide
/// what each named worker does once its inputs are satisfied.
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// Start the worker for `name`. Inputs are read through `ctx`.
    async fn start(&self, name: &str, ctx: &Context) -> anyhow::Result<Arc<dyn Worker>>;

    /// Run the model upgrade steps before the upgrade gate opens.
    async fn upgrade(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Collaborators that idle until stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleCollaborators;

#[async_trait]
impl Collaborators for IdleCollaborators {
    async fn start(&self, name: &str, ctx: &Context) -> anyhow::Result<Arc<dyn Worker>> {
        info!(manifold = %ctx.name(), worker = %name, "starting idle worker");
        let worker = name.to_owned();
        Ok(Arc::new(TaskWorker::spawn(name, |stop| async move {
            stop.stopped().await;
            debug!(worker = %worker, "idle worker stopped");
            Ok(())
        })))
    }
}
