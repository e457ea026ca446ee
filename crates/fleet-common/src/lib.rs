//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the agent runtime."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Shared primitives for the fleet agent workspace.
//! This crate exposes configuration loading and logging setup consumed
//! across the workspace.

pub mod config;
pub mod logging;

pub use config::{
    AgentConfig, AppConfig, ConditionsConfig, EngineConfig, Life, LoadedAppConfig, LoggingConfig,
    MetricsConfig, MigrationPhase, Topology,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
