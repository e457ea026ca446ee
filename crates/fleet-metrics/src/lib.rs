//! ---
//! fleet_section: "03-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Metrics collection and diagnostics export."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Prometheus instrumentation for the agent runtime and the HTTP endpoint
//! serving it together with the engine report.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub type SharedRegistry = Arc<Registry>;

/// Produces the JSON body served at `/report`.
pub type ReportProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    let name = collector
        .desc()
        .first()
        .map(|desc| desc.fq_name.clone())
        .unwrap_or_default();
    registry
        .register(Box::new(collector.clone()))
        .with_context(|| format!("cannot register metric {}", name))?;
    Ok(collector)
}

#[derive(Clone)]
struct Exporter {
    registry: SharedRegistry,
    report: Option<ReportProvider>,
}

/// Serve `/metrics`, `/healthz` and, with a provider, `/report` on `addr`.
///
/// Port 0 binds an ephemeral port; [`MetricsServer::addr`] reports the real one.
pub async fn spawn_http_server(
    registry: SharedRegistry,
    report: Option<ReportProvider>,
    addr: SocketAddr,
) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen for metrics on {}", addr))?;
    let bound = listener
        .local_addr()
        .context("metrics listener has no local address")?;

    let mut router = Router::new()
        .route("/metrics", get(scrape))
        .route("/healthz", get(|| async { "ok" }));
    if report.is_some() {
        router = router.route("/report", get(engine_report));
    }
    let app = router.with_state(Exporter { registry, report });

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .await
            .context("metrics endpoint failed")
    });
    info!(address = %bound, "metrics endpoint listening");

    Ok(MetricsServer {
        addr: bound,
        stop: Some(stop),
        task,
    })
}

async fn scrape(State(exporter): State<Exporter>) -> Result<impl IntoResponse, StatusCode> {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&exporter.registry.gather())
        .map_err(|err| {
            error!(error = %err, "cannot encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_owned())], body))
}

async fn engine_report(
    State(exporter): State<Exporter>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let provider = exporter.report.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(provider()))
}

/// Running metrics endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("metrics endpoint task panicked")?
    }
}

/// Process-level daemon metrics.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts: IntCounter,
    config_load: Histogram,
    info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts = register(
            &registry,
            IntCounter::new("fleetd_starts_total", "Times the daemon has started")?,
        )?;
        let config_load = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "fleetd_config_load_seconds",
                    "Duration of configuration loading and validation",
                )
                .buckets(prometheus::exponential_buckets(0.0005, 4.0, 8)?),
            )?,
        )?;
        let info = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("fleetd_info", "Constant 1 labelled with version and topology"),
                &["version", "topology"],
            )?,
        )?;
        Ok(Self {
            starts,
            config_load,
            info,
        })
    }

    pub fn inc_start(&self) {
        self.starts.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, topology: &str) {
        self.info.with_label_values(&[version, topology]).set(1);
    }
}

fn per_manifold(name: &str, help: &str) -> Result<IntCounterVec> {
    Ok(IntCounterVec::new(Opts::new(name, help), &["manifold"])?)
}

/// Node lifecycle metrics recorded by the dependency engine.
#[derive(Clone, Debug)]
pub struct EngineMetrics {
    manifolds: IntGauge,
    nodes: IntGaugeVec,
    starts: IntCounterVec,
    failures: IntCounterVec,
    bounces: IntCounterVec,
    terminal: IntCounterVec,
    stop_timeouts: IntCounter,
}

impl EngineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        Ok(Self {
            manifolds: register(
                &registry,
                IntGauge::new(
                    "fleet_engine_manifolds_total",
                    "Manifolds registered with the engine",
                )?,
            )?,
            nodes: register(
                &registry,
                IntGaugeVec::new(
                    Opts::new("fleet_engine_nodes", "Nodes per lifecycle state"),
                    &["state"],
                )?,
            )?,
            starts: register(
                &registry,
                per_manifold("fleet_engine_starts_total", "Successful worker starts")?,
            )?,
            failures: register(
                &registry,
                per_manifold(
                    "fleet_engine_failures_total",
                    "Ordinary start or worker failures",
                )?,
            )?,
            bounces: register(
                &registry,
                per_manifold("fleet_engine_bounces_total", "Immediate restarts requested")?,
            )?,
            terminal: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(
                        "fleet_engine_terminal_total",
                        "Nodes parked for the rest of the run",
                    ),
                    &["manifold", "reason"],
                )?,
            )?,
            stop_timeouts: register(
                &registry,
                IntCounter::new(
                    "fleet_engine_stop_timeouts_total",
                    "Workers that outlived the stop timeout",
                )?,
            )?,
        })
    }

    pub fn set_manifold_count(&self, count: usize) {
        self.manifolds.set(count as i64);
    }

    pub fn set_state_count(&self, state: &str, count: usize) {
        self.nodes.with_label_values(&[state]).set(count as i64);
    }

    pub fn record_start(&self, manifold: &str) {
        self.starts.with_label_values(&[manifold]).inc();
    }

    pub fn record_failure(&self, manifold: &str) {
        self.failures.with_label_values(&[manifold]).inc();
    }

    pub fn record_bounce(&self, manifold: &str) {
        self.bounces.with_label_values(&[manifold]).inc();
    }

    /// `reason` is `fatal` or `uninstall`.
    pub fn record_terminal(&self, manifold: &str, reason: &str) {
        self.terminal.with_label_values(&[manifold, reason]).inc();
    }

    pub fn record_stop_timeout(&self) {
        self.stop_timeouts.inc();
    }
}

pub use prometheus;
