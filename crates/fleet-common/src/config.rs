//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the agent runtime."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_error_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_backoff_factor() -> f64 {
    1.2
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9797))
}

fn default_true() -> bool {
    true
}

fn default_agent_tag() -> String {
    "machine-0".to_owned()
}

fn default_model() -> String {
    "controller".to_owned()
}

/// Primary configuration object for the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub conditions: ConditionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Configuration together with the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FLEET_CONFIG";

    /// Load the first configuration found.
    ///
    /// A non-empty `FLEET_CONFIG` names the only file considered, and it must
    /// exist. Otherwise the first existing candidate wins; with none, defaults
    /// apply.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let forced = std::env::var_os(Self::ENV_CONFIG_PATH)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let source = forced.or_else(|| {
            candidates
                .iter()
                .map(AsRef::as_ref)
                .find(|candidate| candidate.is_file())
                .map(Path::to_path_buf)
        });

        let Some(path) = source else {
            debug!(candidates = candidates.len(), "no configuration file; using defaults");
            return Ok(LoadedAppConfig {
                config: AppConfig::default(),
                source: None,
            });
        };
        let config = Self::read(&path)?;
        Ok(LoadedAppConfig {
            config,
            source: Some(path),
        })
    }

    fn read(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "reading configuration");
        fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?
            .parse()
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.tag.trim().is_empty() {
            return Err(anyhow!("agent tag must not be empty"));
        }
        self.engine.validate()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            agent: AgentConfig::default(),
            engine: EngineConfig::default(),
            conditions: ConditionsConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("malformed TOML")?;
        config.validate()?;
        Ok(config)
    }
}

/// Deployment shape selecting the fixed manifold table the agent runs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Machine-based model: provisioners, firewaller, instance poller.
    #[default]
    Cluster,
    /// Container-orchestrated model: broker tracker and container provisioners.
    Standalone,
}

impl std::str::FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Topology::Cluster, Topology::Standalone]
            .into_iter()
            .find(|topology| topology.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown topology {:?}", s))
    }
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Cluster => "cluster",
            Topology::Standalone => "standalone",
        }
    }
}

/// Identity of the agent hosting the model workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_tag")]
    pub tag: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tag: default_agent_tag(),
            model: default_model(),
        }
    }
}

/// Timing policy applied by the dependency engine.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Delay before the first restart after an ordinary failure.
    #[serde(default = "default_error_delay", rename = "error_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub error_delay: Duration,
    /// Delay before restarting a node that bounced. Zero restarts immediately.
    #[serde(default, rename = "bounce_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub bounce_delay: Duration,
    /// Multiplier applied to the delay for every consecutive failure.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for any restart delay.
    #[serde(default = "default_max_delay", rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Random jitter added on top of computed failure delays.
    #[serde(default, rename = "jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
    /// How long a killed worker may take to exit before it is reported as a fault.
    #[serde(default = "default_stop_timeout", rename = "stop_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(anyhow!(
                "engine backoff_factor must be >= 1.0 (got {})",
                self.backoff_factor
            ));
        }
        if self.max_delay < self.error_delay {
            return Err(anyhow!(
                "engine max_delay ({:?}) must not be shorter than error_delay ({:?})",
                self.max_delay,
                self.error_delay
            ));
        }
        if self.stop_timeout.is_zero() {
            return Err(anyhow!("engine stop_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_delay: default_error_delay(),
            bounce_delay: Duration::ZERO,
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            jitter: Duration::ZERO,
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// Life cycle of the model the agent is responsible for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

/// Phase of a model migration as reported by the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationPhase {
    #[default]
    None,
    Quiesce,
    Import,
    Validation,
    SuccessCommit,
    Logtransfer,
    Reap,
    Done,
    Abort,
    Aborted,
}

impl MigrationPhase {
    /// Whether workers guarded by the migration fortress may run in this phase.
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            MigrationPhase::None | MigrationPhase::Done | MigrationPhase::Aborted
        )
    }
}

/// Initial values for the externally supplied conditions backing flag manifolds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionsConfig {
    #[serde(default = "default_true")]
    pub responsible: bool,
    #[serde(default)]
    pub life: Life,
    #[serde(default = "default_true")]
    pub credential_valid: bool,
    #[serde(default)]
    pub migration_phase: MigrationPhase,
    #[serde(default = "default_true")]
    pub upgrade_complete: bool,
}

impl Default for ConditionsConfig {
    fn default() -> Self {
        Self {
            responsible: true,
            life: Life::Alive,
            credential_valid: true,
            migration_phase: MigrationPhase::None,
            upgrade_complete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
