//! ---
//! fleet_section: "06-daemon"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the fleet agent daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_common::{init_tracing, AppConfig, Topology};
use fleet_dependency::{Engine, EngineHandle};
use fleet_metrics::{new_registry, spawn_http_server, DaemonMetrics, EngineMetrics, ReportProvider};
use fleet_model::{manifolds, Agent, Conditions, Manifolds, ManifoldsConfig};
use fleet_worker::Gate;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Fleet model agent daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured topology")]
    topology: Option<CliTopology>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTopology {
    Cluster,
    Standalone,
}

impl From<CliTopology> for Topology {
    fn from(value: CliTopology) -> Self {
        match value {
            CliTopology::Cluster => Topology::Cluster,
            CliTopology::Standalone => Topology::Standalone,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the model agent until interrupted")]
    Run,
    #[command(about = "Print the manifolds of the selected topology and their inputs")]
    Manifolds {
        #[arg(long, help = "Emit JSON instead of a table")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/fleetd.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();
    if let Some(topology) = cli.topology {
        config.topology = topology.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("fleetd", &config.logging)?;
            match &loaded.source {
                Some(path) => info!(config_path = %path.display(), "configuration loaded"),
                None => info!("no configuration file found; running with defaults"),
            }
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::Manifolds { json } => print_manifolds(&config, json)?,
    }

    Ok(())
}

fn build_manifolds(config: &AppConfig, conditions: &Conditions) -> Manifolds {
    let gate = if config.conditions.upgrade_complete {
        Gate::unlocked()
    } else {
        Gate::new()
    };
    let manifolds_config =
        ManifoldsConfig::new(Agent::from(&config.agent), conditions).with_upgrade_gate(gate);
    manifolds(config.topology, &manifolds_config)
}

async fn run_daemon(config: AppConfig, load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), config.topology.as_str());

    let conditions = Conditions::new(&config.conditions);
    let manifolds = build_manifolds(&config, &conditions);
    let mut engine =
        Engine::new(config.engine).with_metrics(EngineMetrics::new(registry.clone())?);
    engine
        .register_all(manifolds.into_values())
        .context("invalid manifold graph")?;
    let handle = engine.run().context("invalid manifold graph")?;
    info!(
        topology = config.topology.as_str(),
        agent = %config.agent.tag,
        model = %config.agent.model,
        "model agent running"
    );

    let metrics_server = if config.metrics.enabled {
        let provider = report_provider(handle.clone());
        Some(spawn_http_server(registry, Some(provider), config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    tokio::select! {
        interrupted = signal::ctrl_c() => {
            interrupted.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
        }
        finished = handle.wait() => {
            warn!(result = ?finished, "dependency engine stopped on its own");
        }
    }

    let stopped = handle.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    drop(conditions);
    match stopped {
        Ok(()) => {
            info!("model agent stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "model agent stopped uncleanly");
            Err(err.into())
        }
    }
}

fn report_provider(handle: EngineHandle) -> ReportProvider {
    Arc::new(move || match serde_json::to_value(handle.report()) {
        Ok(value) => value,
        Err(err) => serde_json::json!({ "error": err.to_string() }),
    })
}

#[derive(Serialize)]
struct ManifoldRow<'a> {
    name: &'a str,
    inputs: &'a [String],
}

fn print_manifolds(config: &AppConfig, json: bool) -> Result<()> {
    let conditions = Conditions::new(&config.conditions);
    let manifolds = build_manifolds(config, &conditions);
    let mut rows: Vec<ManifoldRow<'_>> = manifolds
        .values()
        .map(|manifold| ManifoldRow {
            name: manifold.name(),
            inputs: manifold.inputs(),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(b.name));

    if json {
        let body = serde_json::to_string_pretty(&rows).context("failed to encode manifolds")?;
        println!("{}", body);
        return Ok(());
    }
    let width = rows.iter().map(|row| row.name.len()).max().unwrap_or(0);
    println!(
        "{} topology, {} manifolds",
        config.topology.as_str(),
        rows.len()
    );
    for row in rows {
        println!("{:width$}  {}", row.name, row.inputs.join(", "), width = width);
    }
    Ok(())
}
