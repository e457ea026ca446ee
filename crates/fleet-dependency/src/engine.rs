//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::any::type_name;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::EngineConfig;
use fleet_metrics::EngineMetrics;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::context::{AbortHandle, Context};
use crate::error::{ConfigError, DependencyError, Disposition, Result};
use crate::graph;
use crate::manifold::Manifold;
use crate::output::Outputs;
use crate::report::{EngineReport, EngineState, NodeReport, NodeState};
use crate::worker::{panic_message, Worker};

/// Collects manifolds and validates the graph before running it.
pub struct Engine {
    config: EngineConfig,
    manifolds: IndexMap<String, Manifold>,
    metrics: Option<EngineMetrics>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            manifolds: IndexMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a manifold to the graph.
    ///
    /// Inputs may name manifolds registered later; a registration that would
    /// close a cycle is rejected and leaves the graph unchanged.
    pub fn register(&mut self, manifold: Manifold) -> std::result::Result<(), ConfigError> {
        graph::check_new(&self.manifolds, &manifold)?;
        let name = manifold.name().to_owned();
        self.manifolds.insert(name.clone(), manifold);
        if let Some(cycle) = graph::find_cycle(&self.manifolds) {
            self.manifolds.shift_remove(&name);
            return Err(ConfigError::Cycle(cycle));
        }
        debug!(manifold = %name, "manifold registered");
        Ok(())
    }

    pub fn register_all(
        &mut self,
        manifolds: impl IntoIterator<Item = Manifold>,
    ) -> std::result::Result<(), ConfigError> {
        for manifold in manifolds {
            self.register(manifold)?;
        }
        Ok(())
    }

    pub fn manifold_names(&self) -> impl Iterator<Item = &str> {
        self.manifolds.keys().map(String::as_str)
    }

    /// Validate that every input exists and spawn the engine loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(self) -> std::result::Result<EngineHandle, ConfigError> {
        graph::check_complete(&self.manifolds)?;
        let mut dependents = graph::dependents(&self.manifolds);
        let order: Vec<String> = self.manifolds.keys().cloned().collect();
        let nodes = self
            .manifolds
            .into_iter()
            .map(|(name, manifold)| {
                let node = Node::new(manifold, dependents.remove(&name).unwrap_or_default());
                (name, node)
            })
            .collect();

        if let Some(metrics) = &self.metrics {
            metrics.set_manifold_count(order.len());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = watch::channel(false);
        let mut runner = Runner {
            backoff: Backoff::new(&self.config),
            bounce_delay: self.config.bounce_delay,
            stop_timeout: self.config.stop_timeout,
            order,
            nodes,
            events_tx,
            events_rx,
            kill_rx,
            publisher: None,
            dying: false,
            faults: Vec::new(),
            metrics: self.metrics,
        };
        let (publisher, snapshot) = watch::channel(Arc::new(runner.snapshot()));
        runner.publisher = Some(publisher);
        tokio::spawn(runner.run());

        Ok(EngineHandle {
            kill: Arc::new(kill_tx),
            snapshot,
        })
    }
}

struct Snapshot {
    report: EngineReport,
    outputs: HashMap<String, Outputs>,
}

/// Cloneable control surface of a running engine.
///
/// Queries read the most recently published snapshot and never wait on
/// workers. Dropping every handle stops the engine.
#[derive(Clone)]
pub struct EngineHandle {
    kill: Arc<watch::Sender<bool>>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
}

impl EngineHandle {
    /// Begin shutdown: every node is stopped, dependents before their inputs.
    pub fn kill(&self) {
        self.kill.send_replace(true);
    }

    pub fn report(&self) -> EngineReport {
        self.snapshot.borrow().report.clone()
    }

    /// Output of type `T` from a currently started manifold.
    pub fn output<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Result<T> {
        let snapshot = self.snapshot.borrow().clone();
        if snapshot.report.node(name).is_none() {
            return Err(ConfigError::UnknownManifold(name.to_owned()).into());
        }
        let outputs = snapshot
            .outputs
            .get(name)
            .ok_or_else(|| DependencyError::NotAvailable(name.to_owned()))?;
        outputs
            .get::<T>()
            .ok_or_else(|| DependencyError::TypeMismatch {
                manifold: name.to_owned(),
                requested: type_name::<T>(),
                available: outputs.type_names(),
            })
    }

    /// Wait until a published report satisfies `predicate`.
    pub async fn until<F>(&self, mut predicate: F) -> Result<EngineReport>
    where
        F: FnMut(&EngineReport) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(&snapshot.report))
            .await
            .map_err(|_| DependencyError::EngineGone)?;
        Ok(snapshot.report.clone())
    }

    /// Wait for the engine to stop; reports workers that outlived the stop timeout.
    pub async fn wait(&self) -> Result<()> {
        let report = self
            .until(|report| report.state == EngineState::Stopped)
            .await?;
        if report.faults.is_empty() {
            Ok(())
        } else {
            Err(DependencyError::StopTimeout(report.faults))
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.kill();
        self.wait().await
    }
}

type StartResult = anyhow::Result<(Arc<dyn Worker>, Outputs)>;

enum Event {
    Started {
        name: String,
        generation: u64,
        result: StartResult,
    },
    Stopped {
        name: String,
        generation: u64,
        result: anyhow::Result<()>,
    },
    RetryDue {
        name: String,
        generation: u64,
    },
    StopOverdue {
        name: String,
        generation: u64,
    },
}

/// What keeps a stopped node from being started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Ready,
    Backoff,
    InputsChange,
    Uninstalled,
    Fatal,
}

struct Node {
    manifold: Manifold,
    dependents: Vec<String>,
    state: NodeState,
    generation: u64,
    worker: Option<Arc<dyn Worker>>,
    outputs: Option<Outputs>,
    abort: Option<AbortHandle>,
    stop_requested: bool,
    killed: bool,
    deadline_armed: bool,
    overdue: bool,
    hold: Hold,
    last_error: Option<String>,
    error_count: u32,
    start_count: u64,
    started_at: Option<DateTime<Utc>>,
}

impl Node {
    fn new(manifold: Manifold, dependents: Vec<String>) -> Self {
        Self {
            manifold,
            dependents,
            state: NodeState::Stopped,
            generation: 0,
            worker: None,
            outputs: None,
            abort: None,
            stop_requested: false,
            killed: false,
            deadline_armed: false,
            overdue: false,
            hold: Hold::Ready,
            last_error: None,
            error_count: 0,
            start_count: 0,
            started_at: None,
        }
    }
}

/// Single coordinating task owning all node state.
struct Runner {
    backoff: Backoff,
    bounce_delay: Duration,
    stop_timeout: Duration,
    order: Vec<String>,
    nodes: HashMap<String, Node>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    kill_rx: watch::Receiver<bool>,
    publisher: Option<watch::Sender<Arc<Snapshot>>>,
    dying: bool,
    faults: Vec<String>,
    metrics: Option<EngineMetrics>,
}

impl Runner {
    async fn run(mut self) {
        info!(manifolds = self.order.len(), "dependency engine running");
        self.reconcile();
        self.publish();
        loop {
            if self.dying && self.is_quiescent() {
                break;
            }
            tokio::select! {
                changed = self.kill_rx.changed(), if !self.dying => {
                    if changed.is_err() {
                        debug!("all engine handles dropped");
                    }
                    self.begin_shutdown();
                }
                Some(event) = self.events_rx.recv() => self.handle(event),
            }
            self.reconcile();
            self.publish();
        }
        if self.faults.is_empty() {
            info!("dependency engine stopped");
        } else {
            error!(faults = ?self.faults, "dependency engine stopped with stuck workers");
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Started {
                name,
                generation,
                result,
            } => self.on_started(name, generation, result),
            Event::Stopped {
                name,
                generation,
                result,
            } => self.on_stopped(name, generation, result),
            Event::RetryDue { name, generation } => {
                if let Some(node) = self.nodes.get_mut(&name) {
                    if node.generation == generation && node.hold == Hold::Backoff {
                        node.hold = Hold::Ready;
                    }
                }
            }
            Event::StopOverdue { name, generation } => self.on_stop_overdue(name, generation),
        }
    }

    fn begin_shutdown(&mut self) {
        if self.dying {
            return;
        }
        self.dying = true;
        info!("dependency engine stopping");
        for name in self.order.clone() {
            self.request_stop(&name);
        }
        for name in self.order.clone() {
            let node = &self.nodes[&name];
            if node.overdue && node.state.is_active() {
                let generation = node.generation;
                self.schedule(self.stop_timeout, Event::StopOverdue { name, generation });
            }
        }
    }

    fn is_quiescent(&self) -> bool {
        self.nodes.values().all(|node| !node.state.is_active())
    }

    /// No transitive dependent of `name` has a live worker or start.
    fn dependents_quiescent(&self, name: &str) -> bool {
        self.nodes[name].dependents.iter().all(|dependent| {
            !self.nodes[dependent].state.is_active() && self.dependents_quiescent(dependent)
        })
    }

    fn can_start(&self, name: &str) -> bool {
        let node = &self.nodes[name];
        node.state == NodeState::Stopped
            && node.hold == Hold::Ready
            && node
                .manifold
                .inputs()
                .iter()
                .all(|input| self.nodes[input].state == NodeState::Started)
            && self.dependents_quiescent(name)
    }

    fn reconcile(&mut self) {
        self.kill_ready();
        if self.dying {
            return;
        }
        for name in self.order.clone() {
            if self.can_start(&name) {
                self.start(&name);
            }
        }
    }

    fn start(&mut self, name: &str) {
        let resources: Vec<(String, Outputs)> = self.nodes[name]
            .manifold
            .inputs()
            .iter()
            .map(|input| {
                let outputs = self.nodes[input].outputs.clone().unwrap_or_default();
                (input.clone(), outputs)
            })
            .collect();
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        node.generation += 1;
        node.state = NodeState::Starting;
        node.stop_requested = false;
        node.killed = false;
        node.deadline_armed = false;
        node.overdue = false;
        let (ctx, abort) = Context::new(&node.manifold, resources);
        node.abort = Some(abort);

        let manifold = node.manifold.clone();
        let generation = node.generation;
        let tx = self.events_tx.clone();
        let name = name.to_owned();
        debug!(manifold = %name, generation, "starting manifold");
        tokio::spawn(async move {
            let starter = manifold.clone();
            let started = AssertUnwindSafe(async move { starter.start(ctx).await })
                .catch_unwind()
                .await;
            let result = match started {
                Ok(Ok(worker)) => match manifold.output(worker.as_ref()) {
                    Ok(outputs) => Ok((worker, outputs)),
                    Err(err) => {
                        worker.kill();
                        if let Err(exit) = worker.wait().await {
                            debug!(manifold = %name, error = %exit, "discarded worker exited with error");
                        }
                        Err(err.context("failed to compute outputs"))
                    }
                },
                Ok(Err(err)) => Err(err),
                Err(panic) => Err(DependencyError::Fatal(format!(
                    "start panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .into()),
            };
            let _ = tx.send(Event::Started {
                name,
                generation,
                result,
            });
        });
    }

    fn on_started(&mut self, name: String, generation: u64, result: StartResult) {
        let abandon = self.dying;
        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        if node.generation != generation || node.state != NodeState::Starting {
            if let Ok((worker, _)) = result {
                worker.kill();
            }
            return;
        }
        node.abort = None;

        let (worker, outputs) = match result {
            Ok(started) => started,
            Err(err) => {
                let requested = std::mem::take(&mut node.stop_requested);
                self.settle(&name, Err(err), requested);
                return;
            }
        };

        self.watch_worker(&name, generation, Arc::clone(&worker));
        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        node.worker = Some(worker);
        if abandon || node.stop_requested {
            debug!(manifold = %name, "start completed after stop request; killing worker");
            node.state = NodeState::Stopping;
            node.stop_requested = true;
            node.killed = true;
            if let Some(worker) = &node.worker {
                worker.kill();
            }
            if !node.deadline_armed {
                node.deadline_armed = true;
                self.schedule(self.stop_timeout, Event::StopOverdue { name, generation });
            }
            return;
        }

        node.state = NodeState::Started;
        node.outputs = Some(outputs);
        node.start_count += 1;
        node.started_at = Some(Utc::now());
        node.error_count = 0;
        node.last_error = None;
        info!(manifold = %name, starts = node.start_count, "manifold started");
        let dependents = node.dependents.clone();
        for dependent in dependents {
            if let Some(dependent) = self.nodes.get_mut(&dependent) {
                if dependent.hold == Hold::InputsChange {
                    dependent.hold = Hold::Ready;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_start(&name);
        }
    }

    fn on_stopped(&mut self, name: String, generation: u64, result: anyhow::Result<()>) {
        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        if node.generation != generation || node.worker.is_none() {
            return;
        }
        node.worker = None;
        node.outputs = None;
        node.killed = false;
        let requested = std::mem::take(&mut node.stop_requested);
        let dependents = node.dependents.clone();
        debug!(manifold = %name, requested, "worker exited");
        self.settle(&name, result, requested);
        for dependent in dependents {
            self.request_stop(&dependent);
        }
    }

    /// Apply the outcome of a start or worker run to a node that is no longer active.
    fn settle(&mut self, name: &str, result: anyhow::Result<()>, requested: bool) {
        let disposition = match result {
            Ok(()) => Disposition::Clean,
            Err(err) => match self.nodes[name].manifold.filter(err) {
                Some(err) => Disposition::of(&err),
                None => Disposition::Clean,
            },
        };
        let bounce_delay = self.bounce_delay;
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        node.state = NodeState::Stopped;
        let mut retry_after = None;
        match disposition {
            Disposition::Clean
            | Disposition::Missing
            | Disposition::Bounce
            | Disposition::Failure(_)
                if requested =>
            {
                node.hold = Hold::Ready;
            }
            Disposition::Clean => {
                debug!(manifold = %name, "manifold stopped cleanly; waiting for an input to change");
                node.hold = Hold::InputsChange;
            }
            Disposition::Missing => {
                debug!(manifold = %name, "dependency missing; waiting for an input to change");
                node.hold = Hold::InputsChange;
            }
            Disposition::Bounce => {
                debug!(manifold = %name, "manifold bounced");
                if bounce_delay.is_zero() {
                    node.hold = Hold::Ready;
                } else {
                    node.hold = Hold::Backoff;
                    retry_after = Some(bounce_delay);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_bounce(name);
                }
            }
            Disposition::Uninstall => {
                info!(manifold = %name, "manifold uninstalled");
                node.hold = Hold::Uninstalled;
                if let Some(metrics) = &self.metrics {
                    metrics.record_terminal(name, "uninstall");
                }
            }
            Disposition::Fatal(reason) => {
                error!(manifold = %name, error = %reason, "manifold failed fatally");
                node.state = NodeState::Error;
                node.hold = Hold::Fatal;
                node.last_error = Some(reason);
                if let Some(metrics) = &self.metrics {
                    metrics.record_terminal(name, "fatal");
                }
            }
            Disposition::Failure(reason) => {
                node.error_count = node.error_count.saturating_add(1);
                node.hold = Hold::Backoff;
                let failures = node.error_count;
                let delay = self.backoff.delay(failures);
                warn!(
                    manifold = %name,
                    error = %reason,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "manifold failed; restarting after backoff"
                );
                node.last_error = Some(reason);
                retry_after = Some(delay);
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(name);
                }
            }
        }
        if let Some(delay) = retry_after {
            let generation = node.generation;
            self.schedule(
                delay,
                Event::RetryDue {
                    name: name.to_owned(),
                    generation,
                },
            );
        }
    }

    /// Stop `name` and, first, everything that depends on it.
    fn request_stop(&mut self, name: &str) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        match node.state {
            NodeState::Stopped | NodeState::Error => return,
            NodeState::Starting => {
                if !node.stop_requested {
                    node.stop_requested = true;
                    if let Some(abort) = &node.abort {
                        abort.abort();
                    }
                    debug!(manifold = %name, "aborting start");
                    if !node.deadline_armed {
                        node.deadline_armed = true;
                        let generation = node.generation;
                        self.schedule(
                            self.stop_timeout,
                            Event::StopOverdue {
                                name: name.to_owned(),
                                generation,
                            },
                        );
                    }
                }
                return;
            }
            NodeState::Started => {
                node.state = NodeState::Stopping;
                node.outputs = None;
                node.stop_requested = true;
            }
            NodeState::Stopping => {
                node.stop_requested = true;
            }
        }
        let dependents = node.dependents.clone();
        for dependent in dependents {
            self.request_stop(&dependent);
        }
    }

    /// Kill stopping workers whose dependents have all gone quiet.
    fn kill_ready(&mut self) {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|name| {
                let node = &self.nodes[name.as_str()];
                node.state == NodeState::Stopping
                    && !node.killed
                    && node.worker.is_some()
                    && self.dependents_quiescent(name)
            })
            .cloned()
            .collect();
        for name in ready {
            let Some(node) = self.nodes.get_mut(&name) else {
                continue;
            };
            node.killed = true;
            if let Some(worker) = &node.worker {
                worker.kill();
            }
            debug!(manifold = %name, "worker killed");
            if !node.deadline_armed {
                node.deadline_armed = true;
                let generation = node.generation;
                self.schedule(self.stop_timeout, Event::StopOverdue { name, generation });
            }
        }
    }

    /// A worker overran its stop deadline.
    ///
    /// While running the node stays in place, still blocking its inputs, and
    /// settles when the worker finally exits. During shutdown it is abandoned.
    fn on_stop_overdue(&mut self, name: String, generation: u64) {
        let timeout = self.stop_timeout;
        let dying = self.dying;
        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        if node.generation != generation
            || !matches!(node.state, NodeState::Starting | NodeState::Stopping)
        {
            return;
        }
        let first_overrun = !node.overdue;
        node.overdue = true;
        if first_overrun {
            node.last_error = Some(format!("did not stop within {:?}", timeout));
            if let Some(metrics) = &self.metrics {
                metrics.record_stop_timeout();
            }
        }
        if !dying {
            warn!(
                manifold = %name,
                timeout_ms = timeout.as_millis() as u64,
                "worker is slow to stop; its inputs stay down until it exits"
            );
            return;
        }
        error!(
            manifold = %name,
            timeout_ms = timeout.as_millis() as u64,
            "worker did not stop in time; abandoning it"
        );
        node.generation += 1;
        node.state = NodeState::Error;
        node.hold = Hold::Fatal;
        node.worker = None;
        node.outputs = None;
        node.abort = None;
        node.killed = false;
        node.stop_requested = false;
        self.faults.push(name);
    }

    fn watch_worker(&self, name: &str, generation: u64, worker: Arc<dyn Worker>) {
        let tx = self.events_tx.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            let result = worker.wait().await;
            let _ = tx.send(Event::Stopped {
                name,
                generation,
                result,
            });
        });
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn snapshot(&self) -> Snapshot {
        let nodes = self
            .order
            .iter()
            .map(|name| {
                let node = &self.nodes[name];
                NodeReport {
                    name: name.clone(),
                    state: node.state,
                    inputs: node.manifold.inputs().to_vec(),
                    last_error: node.last_error.clone(),
                    error_count: node.error_count,
                    start_count: node.start_count,
                    started_at: node.started_at,
                    uninstalled: node.hold == Hold::Uninstalled,
                    outputs: node
                        .outputs
                        .as_ref()
                        .map(Outputs::type_names)
                        .unwrap_or_default(),
                }
            })
            .collect();
        let outputs = self
            .order
            .iter()
            .filter_map(|name| {
                let node = &self.nodes[name];
                match (&node.state, &node.outputs) {
                    (NodeState::Started, Some(outputs)) => Some((name.clone(), outputs.clone())),
                    _ => None,
                }
            })
            .collect();
        let state = if !self.dying {
            EngineState::Running
        } else if self.is_quiescent() {
            EngineState::Stopped
        } else {
            EngineState::Stopping
        };
        Snapshot {
            report: EngineReport {
                state,
                nodes,
                faults: self.faults.clone(),
            },
            outputs,
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        if let Some(metrics) = &self.metrics {
            for state in NodeState::ALL {
                metrics.set_state_count(state.as_str(), snapshot.report.count(state));
            }
        }
        if let Some(publisher) = &self.publisher {
            publisher.send_replace(Arc::new(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TaskWorker;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use fleet_metrics::{new_registry, SharedRegistry};
    use parking_lot::Mutex;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::{sleep, timeout, Instant};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            error_delay: ms(20),
            backoff_factor: 1.0,
            max_delay: ms(200),
            stop_timeout: ms(500),
            ..EngineConfig::default()
        }
    }

    async fn within<T>(future: impl Future<Output = T>) -> T {
        timeout(Duration::from_secs(5), future)
            .await
            .expect("condition reached in time")
    }

    fn idle_worker(name: &'static str) -> TaskWorker {
        TaskWorker::spawn(name, |stop| async move {
            stop.stopped().await;
            Ok(())
        })
    }

    fn recording(name: &'static str, inputs: &[&'static str], journal: Journal) -> Manifold {
        Manifold::new(name, move |_ctx| {
            let journal = journal.clone();
            async move {
                journal.lock().push(format!("start {}", name));
                Ok(TaskWorker::spawn(name, move |stop| async move {
                    stop.stopped().await;
                    journal.lock().push(format!("stop {}", name));
                    Ok(())
                }))
            }
        })
        .with_inputs(inputs.to_vec())
    }

    struct ValueWorker {
        value: bool,
        task: TaskWorker,
    }

    #[async_trait]
    impl Worker for ValueWorker {
        fn kill(&self) {
            self.task.kill();
        }

        async fn wait(&self) -> anyhow::Result<()> {
            self.task.wait().await
        }
    }

    /// Exposes the current value of `source` and bounces when it changes.
    fn value_flag(name: &'static str, source: watch::Receiver<bool>) -> Manifold {
        journaled_flag(name, source, Journal::default())
    }

    fn journaled_flag(
        name: &'static str,
        source: watch::Receiver<bool>,
        journal: Journal,
    ) -> Manifold {
        Manifold::new(name, move |_ctx| {
            let mut rx = source.clone();
            let journal = journal.clone();
            async move {
                journal.lock().push(format!("start {}", name));
                let value = *rx.borrow_and_update();
                let task = TaskWorker::spawn(name, move |stop| async move {
                    let exit: anyhow::Result<()> = tokio::select! {
                        _ = stop.stopped() => Ok(()),
                        _ = rx.changed() => Err(DependencyError::Bounce.into()),
                    };
                    journal.lock().push(format!("stop {}", name));
                    exit
                });
                Ok(ValueWorker { value, task })
            }
        })
        .with_output(|worker: &ValueWorker| Outputs::new().with(worker.value))
    }

    fn counter(registry: &SharedRegistry, family: &str, manifold: &str) -> f64 {
        registry
            .gather()
            .iter()
            .filter(|metrics| metrics.get_name() == family)
            .flat_map(|metrics| metrics.get_metric().iter())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "manifold" && label.get_value() == manifold)
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn starts_in_dependency_order_and_stops_in_reverse() {
        let journal = Journal::default();
        let mut engine = Engine::new(fast_config());
        engine
            .register(recording("worker", &["agent", "flag"], journal.clone()))
            .expect("forward references are allowed");
        engine
            .register(recording("flag", &["agent"], journal.clone()))
            .expect("register flag");
        engine
            .register(recording("agent", &[], journal.clone()))
            .expect("register agent");
        let handle = engine.run().expect("graph is complete");

        within(handle.until(|report| report.count(NodeState::Started) == 3))
            .await
            .expect("engine running");
        assert_eq!(
            journal.lock().clone(),
            vec!["start agent", "start flag", "start worker"]
        );

        within(handle.shutdown()).await.expect("clean shutdown");
        assert_eq!(
            journal.lock()[3..].to_vec(),
            vec!["stop worker", "stop flag", "stop agent"]
        );
        let report = handle.report();
        assert_eq!(report.state, EngineState::Stopped);
        assert_eq!(report.count(NodeState::Stopped), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounce_restarts_dependents_with_the_new_value() {
        let (source_tx, source_rx) = watch::channel(true);
        let observed = Journal::default();
        let consumer = {
            let observed = observed.clone();
            Manifold::new("worker", move |ctx: Context| {
                let observed = observed.clone();
                async move {
                    let value: bool = ctx.get("flag")?;
                    observed.lock().push(value.to_string());
                    Ok(idle_worker("worker"))
                }
            })
            .with_inputs(["flag"])
        };

        let mut engine = Engine::new(fast_config());
        engine
            .register_all([value_flag("flag", source_rx), consumer])
            .expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.state_of("worker") == Some(NodeState::Started)))
            .await
            .expect("worker started");
        assert_eq!(handle.output::<bool>("flag"), Ok(true));

        source_tx.send_replace(false);
        let report = within(handle.until(|r| {
            r.node("worker")
                .is_some_and(|n| n.start_count == 2 && n.state == NodeState::Started)
        }))
        .await
        .expect("worker restarted");
        assert_eq!(observed.lock().clone(), vec!["true", "false"]);
        let flag = report.node("flag").expect("flag report");
        assert_eq!(flag.start_count, 2);
        assert_eq!(flag.error_count, 0);
        assert_eq!(handle.output::<bool>("flag"), Ok(false));

        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_back_off_then_recover() {
        let attempts = Arc::new(AtomicU32::new(0));
        let flaky = {
            let attempts = attempts.clone();
            Manifold::new("flaky", move |_ctx| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        return Err(anyhow!("controller unreachable"));
                    }
                    Ok(idle_worker("flaky"))
                }
            })
        };
        let mut engine = Engine::new(fast_config());
        engine.register(flaky).expect("register");
        let began = Instant::now();
        let handle = engine.run().expect("run");

        let report = within(handle.until(|r| r.state_of("flaky") == Some(NodeState::Started)))
            .await
            .expect("eventually started");
        assert!(began.elapsed() >= ms(60), "three backoff delays must elapse");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let node = report.node("flaky").expect("node");
        assert_eq!(node.error_count, 0);
        assert_eq!(node.start_count, 1);
        assert_eq!(node.last_error, None);

        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_waits_for_an_input_to_change() {
        let (source_tx, source_rx) = watch::channel(true);
        let ready = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));
        let picky = {
            let ready = ready.clone();
            let attempts = attempts.clone();
            Manifold::new("picky", move |_ctx| {
                let ready = ready.clone();
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if !ready.load(Ordering::SeqCst) {
                        return Err(DependencyError::Missing.into());
                    }
                    Ok(idle_worker("picky"))
                }
            })
            .with_inputs(["flag"])
        };
        let mut engine = Engine::new(fast_config());
        engine
            .register_all([value_flag("flag", source_rx), picky])
            .expect("register");
        let handle = engine.run().expect("run");

        within(async {
            while attempts.load(Ordering::SeqCst) == 0 {
                sleep(ms(5)).await;
            }
        })
        .await;
        ready.store(true, Ordering::SeqCst);
        sleep(ms(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "missing is not retried on a timer");
        let report = handle.report();
        assert_eq!(report.state_of("picky"), Some(NodeState::Stopped));
        assert_eq!(report.node("picky").map(|n| n.error_count), Some(0));

        source_tx.send_replace(false);
        within(handle.until(|r| r.state_of("picky") == Some(NodeState::Started)))
            .await
            .expect("started after input changed");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn uninstalled_nodes_never_restart() {
        let attempts = Arc::new(AtomicU32::new(0));
        let once = {
            let attempts = attempts.clone();
            Manifold::new("once", move |_ctx| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let worker: anyhow::Result<TaskWorker> = Err(DependencyError::Uninstall.into());
                    worker
                }
            })
        };
        let mut engine = Engine::new(fast_config());
        engine.register(once).expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.node("once").is_some_and(|n| n.uninstalled)))
            .await
            .expect("uninstalled");
        sleep(ms(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_panic_parks_only_that_node() {
        let broken = Manifold::new("broken", |_ctx| async move {
            if true {
                panic!("bad wiring");
            }
            Ok(idle_worker("broken"))
        });
        let journal = Journal::default();
        let mut engine = Engine::new(fast_config());
        engine
            .register_all([broken, recording("healthy", &[], journal.clone())])
            .expect("register");
        let handle = engine.run().expect("run");

        let report = within(handle.until(|r| {
            r.state_of("broken") == Some(NodeState::Error)
                && r.state_of("healthy") == Some(NodeState::Started)
        }))
        .await
        .expect("settled");
        let broken = report.node("broken").expect("node");
        assert!(broken
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("bad wiring")));
        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn filtered_errors_count_as_clean_exits() {
        let failing = Manifold::new("quiet", |_ctx| async move {
            Ok(TaskWorker::spawn("quiet", |_stop| async move {
                Err(anyhow!("expected shutdown noise"))
            }))
        })
        .with_filter(|_err| None);
        let mut engine = Engine::new(fast_config());
        engine.register(failing).expect("register");
        let handle = engine.run().expect("run");
        let report = within(handle.until(|r| {
            r.node("quiet")
                .is_some_and(|n| n.start_count == 1 && n.state == NodeState::Stopped)
        }))
        .await
        .expect("stopped");
        let node = report.node("quiet").expect("node");
        assert_eq!(node.error_count, 0);
        assert_eq!(node.last_error, None);
        sleep(ms(80)).await;
        assert_eq!(handle.report().node("quiet").map(|n| n.start_count), Some(1));
        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flag_bounce_stops_the_chain_leaf_first_before_restarting() {
        let (source_tx, source_rx) = watch::channel(true);
        let journal = Journal::default();
        let mut engine = Engine::new(fast_config());
        engine
            .register_all([
                journaled_flag("flag", source_rx, journal.clone()),
                recording("mid", &["flag"], journal.clone()),
                recording("leaf", &["mid"], journal.clone()),
            ])
            .expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.count(NodeState::Started) == 3))
            .await
            .expect("chain started");

        source_tx.send_replace(false);
        within(handle.until(|r| {
            r.node("leaf")
                .is_some_and(|n| n.start_count == 2 && n.state == NodeState::Started)
        }))
        .await
        .expect("chain restarted");
        assert_eq!(
            journal.lock().clone(),
            vec![
                "start flag",
                "start mid",
                "start leaf",
                "stop flag",
                "stop leaf",
                "stop mid",
                "start flag",
                "start mid",
                "start leaf",
            ]
        );

        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_stops_hold_inputs_down_until_the_worker_exits() {
        let (source_tx, source_rx) = watch::channel(true);
        let journal = Journal::default();
        let lingering = Arc::new(AtomicBool::new(true));
        let slow = {
            let journal = journal.clone();
            Manifold::new("slow", move |_ctx| {
                let journal = journal.clone();
                let lingering = lingering.clone();
                async move {
                    journal.lock().push("start slow".to_owned());
                    Ok(TaskWorker::spawn("slow", move |stop| async move {
                        stop.stopped().await;
                        if lingering.swap(false, Ordering::SeqCst) {
                            sleep(ms(600)).await;
                        }
                        journal.lock().push("stop slow".to_owned());
                        Ok(())
                    }))
                }
            })
            .with_inputs(["flag"])
        };
        let registry = new_registry();
        let metrics = EngineMetrics::new(registry.clone()).expect("metrics");
        let mut engine = Engine::new(EngineConfig {
            stop_timeout: ms(100),
            ..fast_config()
        })
        .with_metrics(metrics);
        engine
            .register_all([journaled_flag("flag", source_rx, journal.clone()), slow])
            .expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.state_of("slow") == Some(NodeState::Started)))
            .await
            .expect("started");

        source_tx.send_replace(false);
        let report = within(handle.until(|r| r.node("slow").is_some_and(|n| n.last_error.is_some())))
            .await
            .expect("overrun recorded");
        assert_eq!(report.state_of("slow"), Some(NodeState::Stopping));
        assert_eq!(report.state_of("flag"), Some(NodeState::Stopped));
        assert_eq!(report.node("flag").map(|n| n.start_count), Some(1));
        assert!(report.faults.is_empty());

        let report = within(handle.until(|r| {
            r.node("slow")
                .is_some_and(|n| n.start_count == 2 && n.state == NodeState::Started)
        }))
        .await
        .expect("slow restarted");
        assert_eq!(report.node("slow").and_then(|n| n.last_error.clone()), None);
        assert_eq!(
            journal.lock().clone(),
            vec![
                "start flag",
                "start slow",
                "stop flag",
                "stop slow",
                "start flag",
                "start slow",
            ]
        );
        let timeouts = registry
            .gather()
            .iter()
            .find(|metrics| metrics.get_name() == "fleet_engine_stop_timeouts_total")
            .map(|metrics| metrics.get_metric()[0].get_counter().get_value());
        assert_eq!(timeouts, Some(1.0));

        within(handle.shutdown()).await.expect("clean shutdown");
        assert!(handle.report().faults.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn aborted_starts_are_discarded_and_retried_when_the_input_returns() {
        let (source_tx, source_rx) = watch::channel(true);
        let attempts = Arc::new(AtomicU32::new(0));
        let aborted = Arc::new(AtomicBool::new(false));
        let hesitant = {
            let attempts = attempts.clone();
            let aborted = aborted.clone();
            Manifold::new("hesitant", move |ctx: Context| {
                let attempts = attempts.clone();
                let aborted = aborted.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        ctx.aborted().await;
                        aborted.store(true, Ordering::SeqCst);
                        return Err(anyhow!("start abandoned"));
                    }
                    Ok(idle_worker("hesitant"))
                }
            })
            .with_inputs(["flag"])
        };
        let mut engine = Engine::new(fast_config());
        engine
            .register_all([value_flag("flag", source_rx), hesitant])
            .expect("register");
        let handle = engine.run().expect("run");

        within(async {
            while attempts.load(Ordering::SeqCst) == 0 {
                sleep(ms(5)).await;
            }
        })
        .await;
        assert_eq!(handle.report().state_of("hesitant"), Some(NodeState::Starting));

        source_tx.send_replace(false);
        let report = within(handle.until(|r| r.state_of("hesitant") == Some(NodeState::Started)))
            .await
            .expect("restarted after input returned");
        assert!(aborted.load(Ordering::SeqCst));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let node = report.node("hesitant").expect("node");
        assert_eq!(node.error_count, 0);
        assert_eq!(node.last_error, None);
        assert_eq!(node.start_count, 1);
        assert_eq!(report.node("flag").map(|n| n.start_count), Some(2));

        within(handle.shutdown()).await.expect("clean shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn discarded_workers_exit_before_the_next_start() {
        let live = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let exposed = {
            let live = live.clone();
            let peak = peak.clone();
            Manifold::new("exposed", move |_ctx| {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    Ok(TaskWorker::spawn("exposed", move |stop| async move {
                        stop.stopped().await;
                        sleep(ms(60)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }))
                }
            })
            .with_output_fn(Arc::new(|_worker: &dyn Worker| -> anyhow::Result<Outputs> {
                Err(anyhow!("api connection closed"))
            }))
        };
        let mut engine = Engine::new(fast_config());
        engine.register(exposed).expect("register");
        let handle = engine.run().expect("run");

        let report = within(handle.until(|r| r.node("exposed").is_some_and(|n| n.error_count >= 3)))
            .await
            .expect("repeated failures");
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(report.node("exposed").map(|n| n.start_count), Some(0));

        within(handle.shutdown()).await.expect("clean shutdown");
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounces_during_a_requested_stop_are_not_counted() {
        let (source_tx, source_rx) = watch::channel(true);
        let echo = Manifold::new("echo", |_ctx| async move {
            Ok(TaskWorker::spawn("echo", |stop| async move {
                stop.stopped().await;
                Err(DependencyError::Bounce.into())
            }))
        })
        .with_inputs(["flag"]);
        let registry = new_registry();
        let metrics = EngineMetrics::new(registry.clone()).expect("metrics");
        let mut engine = Engine::new(fast_config()).with_metrics(metrics);
        engine
            .register_all([value_flag("flag", source_rx), echo])
            .expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.state_of("echo") == Some(NodeState::Started)))
            .await
            .expect("started");

        source_tx.send_replace(false);
        let report = within(handle.until(|r| {
            r.node("echo")
                .is_some_and(|n| n.start_count == 2 && n.state == NodeState::Started)
        }))
        .await
        .expect("echo restarted");
        assert_eq!(report.node("echo").map(|n| n.error_count), Some(0));
        assert_eq!(counter(&registry, "fleet_engine_bounces_total", "flag"), 1.0);
        assert_eq!(counter(&registry, "fleet_engine_bounces_total", "echo"), 0.0);

        within(handle.shutdown()).await.expect("clean shutdown");
        assert_eq!(counter(&registry, "fleet_engine_bounces_total", "echo"), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stuck_workers_are_reported() {
        let stuck = Manifold::new("stuck", |_ctx| async move {
            Ok(TaskWorker::spawn("stuck", |_stop| async move {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            }))
        });
        let mut engine = Engine::new(EngineConfig {
            stop_timeout: ms(100),
            ..fast_config()
        });
        engine.register(stuck).expect("register");
        let handle = engine.run().expect("run");
        within(handle.until(|r| r.state_of("stuck") == Some(NodeState::Started)))
            .await
            .expect("started");

        let err = within(handle.shutdown()).await.expect_err("stop timeout");
        assert_eq!(err, DependencyError::StopTimeout(vec!["stuck".into()]));
        assert_eq!(handle.report().state_of("stuck"), Some(NodeState::Error));
    }

    #[tokio::test]
    async fn registration_rejects_cycles_and_run_rejects_unknown_inputs() {
        let journal = Journal::default();
        let mut engine = Engine::new(fast_config());
        engine
            .register(recording("a", &["b"], journal.clone()))
            .expect("forward reference");
        let err = engine
            .register(recording("b", &["a"], journal.clone()))
            .expect_err("cycle");
        assert_eq!(err, ConfigError::Cycle(vec!["a".into(), "b".into()]));
        assert_eq!(engine.manifold_names().collect::<Vec<_>>(), vec!["a"]);

        let err = engine.run().err().expect("unknown input");
        assert_eq!(
            err,
            ConfigError::UnknownInput {
                name: "a".into(),
                input: "b".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn output_queries_distinguish_unknown_and_stopped() {
        let (_source_tx, source_rx) = watch::channel(true);
        let mut engine = Engine::new(fast_config());
        engine
            .register(value_flag("flag", source_rx))
            .expect("register");
        let handle = engine.run().expect("run");
        assert!(matches!(
            handle.output::<bool>("ghost"),
            Err(DependencyError::Config(ConfigError::UnknownManifold(_)))
        ));
        within(handle.until(|r| r.state_of("flag") == Some(NodeState::Started)))
            .await
            .expect("started");
        assert!(matches!(
            handle.output::<String>("flag"),
            Err(DependencyError::TypeMismatch { .. })
        ));
        within(handle.shutdown()).await.expect("clean shutdown");
        assert_eq!(
            handle.output::<bool>("flag"),
            Err(DependencyError::NotAvailable("flag".into()))
        );
    }
}
