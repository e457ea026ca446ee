//! ---
//! fleet_section: "04-worker-helpers"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reusable workers and manifold decorators."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;

use fleet_dependency::{Context, Manifold, Outputs, TaskWorker, Worker};
use tokio::sync::watch;

use crate::flag::{Flag, FlagWorker};

/// One-way latch: starts locked, stays unlocked once opened.
///
/// The latch outlives manifold restarts, so it is created by the caller and
/// handed to [`gate_manifold`].
#[derive(Clone, Debug)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn unlocked() -> Self {
        let gate = Self::new();
        gate.unlocker().unlock();
        gate
    }

    pub fn unlocker(&self) -> Unlocker {
        Unlocker {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn waiter(&self) -> Waiter {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Capability to open a [`Gate`].
#[derive(Clone, Debug)]
pub struct Unlocker {
    tx: Arc<watch::Sender<bool>>,
}

impl Unlocker {
    pub fn unlock(&self) {
        self.tx.send_if_modified(|open| !std::mem::replace(open, true));
    }
}

/// Capability to observe a [`Gate`].
#[derive(Clone, Debug)]
pub struct Waiter {
    rx: watch::Receiver<bool>,
}

impl Waiter {
    pub fn is_unlocked(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// Manifold exposing the gate's [`Unlocker`] and [`Waiter`].
pub fn gate_manifold(name: &str, gate: Gate) -> Manifold {
    let worker_name = name.to_owned();
    Manifold::new(name, move |_ctx| {
        let worker_name = worker_name.clone();
        async move {
            Ok(TaskWorker::spawn(worker_name, |stop| async move {
                stop.stopped().await;
                Ok(())
            }))
        }
    })
    .with_output_fn(Arc::new(move |_worker: &dyn Worker| {
        Ok::<_, anyhow::Error>(Outputs::new().with(gate.unlocker()).with(gate.waiter()))
    }))
}

/// Flag that is set once the named gate has been unlocked.
pub fn gate_flag_manifold(name: &str, gate_name: &str) -> Manifold {
    let flag = name.to_owned();
    let gate_name = gate_name.to_owned();
    Manifold::new(name, {
        let gate_name = gate_name.clone();
        move |ctx: Context| {
            let flag = flag.clone();
            let gate_name = gate_name.clone();
            async move {
                let waiter: Waiter = ctx.get(&gate_name)?;
                Ok(FlagWorker::spawn(&flag, waiter.watch(), |open: &bool| *open))
            }
        }
    })
    .with_inputs([gate_name])
    .with_output(|worker: &FlagWorker| Outputs::new().with(Flag(worker.value())))
}
