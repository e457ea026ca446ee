//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Dependency engine for long-running workers.
//!
//! A [`Manifold`] declares a named node, the nodes it consumes, how to start
//! its [`Worker`], and which typed [`Outputs`] the running worker exposes. The
//! [`Engine`] starts nodes once all their inputs are started, stops dependents
//! before the inputs they rely on, and restarts failed nodes with backoff.

pub mod backoff;
pub mod context;
pub mod engine;
pub mod error;
mod graph;
pub mod manifold;
pub mod output;
pub mod report;
pub mod worker;

pub use backoff::Backoff;
pub use context::{AbortHandle, Context};
pub use engine::{Engine, EngineHandle};
pub use error::{ConfigError, DependencyError, Result};
pub use manifold::{FilterFn, Manifold, OutputFn, StartFn};
pub use output::Outputs;
pub use report::{EngineReport, EngineState, NodeReport, NodeState};
pub use worker::{AsAny, StopSignal, TaskWorker, Worker};
