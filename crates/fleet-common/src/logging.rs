//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the agent runtime."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const FLEET_LOG: &str = "FLEET_LOG";
const FALLBACK_FILTER: &str = "info";

/// Writer guards; dropping them would lose buffered lines.
static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Output format of the stdout layer. The file layer always writes JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the process-wide subscriber.
///
/// The filter comes from `FLEET_LOG`, then `RUST_LOG`, then `info`. Events go
/// to stdout in the configured format and to `<directory>/<prefix>.log.<date>`
/// as JSON. Only the first call installs anything.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("failed to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file, file_guard) = file_writer(&config.directory, prefix);
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set([file_guard, stdout_guard]);

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer(config.format, stdout))
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(file),
        )
        .try_init()
        .is_ok();

    if installed {
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "logging ready"
        );
    }
    Ok(())
}

fn file_writer(directory: &Path, prefix: &str) -> (NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking(rolling::daily(directory, format!("{}.log", prefix)))
}

fn env_filter() -> EnvFilter {
    let Ok(directive) = std::env::var(FLEET_LOG) else {
        return EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("ignoring {}={:?}: {}", FLEET_LOG, directive, err);
        EnvFilter::new(FALLBACK_FILTER)
    })
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.json().flatten_event(true).with_target(false).boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

/// Stdout subscriber for tests, defaulting to `warn`; repeated calls are no-ops.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_env(FLEET_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
