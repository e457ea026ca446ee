//! ---
//! fleet_section: "04-worker-helpers"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reusable workers and manifold decorators."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;

use fleet_dependency::{Manifold, Outputs, StopSignal, TaskWorker, Worker};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Failures reported by fortress operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FortressError {
    /// The fortress refused the visit, or a lockdown was abandoned.
    #[error("fortress operation aborted")]
    Aborted,
    /// The worker owning the fortress has stopped.
    #[error("fortress is shutting down")]
    Shutdown,
}

/// Access mode of a [`Fortress`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FortressMode {
    Unlocked,
    LockingDown,
    Locked,
}

#[derive(Debug)]
struct State {
    mode: FortressMode,
    visitors: usize,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    idle: Notify,
    reopened: watch::Sender<u64>,
}

impl Inner {
    fn set_mode(&self, state: &mut State, mode: FortressMode) {
        let reopening = state.mode != FortressMode::Unlocked && mode == FortressMode::Unlocked;
        state.mode = mode;
        if reopening {
            self.reopened.send_modify(|epoch| *epoch += 1);
        }
    }
}

/// Three-state gate serialising exclusive work against many concurrent visits.
///
/// While unlocked any number of visits run concurrently. A lockdown refuses
/// new visits and completes once every in-flight visit has finished.
#[derive(Clone)]
pub struct Fortress {
    inner: Arc<Inner>,
}

impl Default for Fortress {
    fn default() -> Self {
        Self::new()
    }
}

impl Fortress {
    pub fn new() -> Self {
        let (reopened, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    mode: FortressMode::Unlocked,
                    visitors: 0,
                    closed: false,
                }),
                idle: Notify::new(),
                reopened,
            }),
        }
    }

    pub fn mode(&self) -> FortressMode {
        self.inner.state.lock().mode
    }

    pub fn visitors(&self) -> usize {
        self.inner.state.lock().visitors
    }

    pub fn guest(&self) -> Guest {
        Guest(self.clone())
    }

    pub fn guard(&self) -> Guard {
        Guard(self.clone())
    }

    /// Register a visitor; the visit lasts until the returned ticket is dropped.
    pub fn enter(&self) -> Result<Visit, FortressError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FortressError::Shutdown);
        }
        if state.mode != FortressMode::Unlocked {
            return Err(FortressError::Aborted);
        }
        state.visitors += 1;
        Ok(Visit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `work` as a visit; refused immediately unless unlocked.
    pub async fn visit<F, Fut, T>(&self, work: F) -> Result<T, FortressError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _visit = self.enter()?;
        Ok(work().await)
    }

    /// Refuse new visits and wait for current ones to finish.
    ///
    /// Completing `abort` first reopens the fortress and yields
    /// [`FortressError::Aborted`]. Locking an already locked fortress succeeds
    /// immediately.
    pub async fn lockdown<A>(&self, abort: A) -> Result<(), FortressError>
    where
        A: Future<Output = ()>,
    {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(FortressError::Shutdown);
            }
            if state.mode == FortressMode::Locked {
                return Ok(());
            }
            self.inner.set_mode(&mut state, FortressMode::LockingDown);
            debug!(visitors = state.visitors, "fortress locking down");
        }

        tokio::pin!(abort);
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(FortressError::Shutdown);
                }
                match state.mode {
                    FortressMode::Locked => return Ok(()),
                    FortressMode::Unlocked => return Err(FortressError::Aborted),
                    FortressMode::LockingDown if state.visitors == 0 => {
                        self.inner.set_mode(&mut state, FortressMode::Locked);
                        info!("fortress locked");
                        return Ok(());
                    }
                    FortressMode::LockingDown => {}
                }
            }
            tokio::select! {
                _ = &mut idle => {}
                _ = &mut abort => {
                    let mut state = self.inner.state.lock();
                    if state.mode == FortressMode::LockingDown {
                        self.inner.set_mode(&mut state, FortressMode::Unlocked);
                    }
                    debug!("fortress lockdown aborted");
                    return Err(FortressError::Aborted);
                }
            }
        }
    }

    /// Reopen for visits; a no-op when already unlocked.
    pub fn unlock(&self) {
        let mut state = self.inner.state.lock();
        if state.mode != FortressMode::Unlocked {
            self.inner.set_mode(&mut state, FortressMode::Unlocked);
            info!("fortress unlocked");
            self.inner.idle.notify_waiters();
        }
    }

    /// Counter bumped every time the fortress reopens after a lockdown.
    pub fn reopened(&self) -> watch::Receiver<u64> {
        self.inner.reopened.subscribe()
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.closed = true;
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Fortress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Fortress")
            .field("mode", &state.mode)
            .field("visitors", &state.visitors)
            .field("closed", &state.closed)
            .finish()
    }
}

/// An in-flight visit; dropping it lets a pending lockdown proceed.
#[must_use = "the visit ends when this ticket is dropped"]
pub struct Visit {
    inner: Arc<Inner>,
}

impl Drop for Visit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.visitors = state.visitors.saturating_sub(1);
        if state.visitors == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Capability to visit a fortress.
#[derive(Clone, Debug)]
pub struct Guest(Fortress);

impl Guest {
    pub fn enter(&self) -> Result<Visit, FortressError> {
        self.0.enter()
    }

    pub async fn visit<F, Fut, T>(&self, work: F) -> Result<T, FortressError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.0.visit(work).await
    }
}

/// Capability to lock and unlock a fortress.
#[derive(Clone, Debug)]
pub struct Guard(Fortress);

impl Guard {
    pub async fn lockdown<A>(&self, abort: A) -> Result<(), FortressError>
    where
        A: Future<Output = ()>,
    {
        self.0.lockdown(abort).await
    }

    pub fn unlock(&self) {
        self.0.unlock()
    }

    pub fn mode(&self) -> FortressMode {
        self.0.mode()
    }
}

/// Worker owning a fortress for the lifetime of one start.
pub struct FortressWorker {
    fortress: Fortress,
    task: TaskWorker,
}

impl FortressWorker {
    /// Runs until killed, or bounces once the fortress reopens after a
    /// lockdown so that housed dependents retry their visits.
    pub fn spawn(name: &str) -> Self {
        let fortress = Fortress::new();
        let owned = fortress.clone();
        let mut reopened = fortress.reopened();
        let task = TaskWorker::spawn(name, move |stop: StopSignal| async move {
            tokio::select! {
                _ = stop.stopped() => {
                    owned.close();
                    Ok(())
                }
                changed = reopened.changed() => {
                    owned.close();
                    match changed {
                        Ok(()) => Err(fleet_dependency::DependencyError::Bounce.into()),
                        Err(_) => Ok(()),
                    }
                }
            }
        });
        Self { fortress, task }
    }

    pub fn fortress(&self) -> &Fortress {
        &self.fortress
    }
}

#[async_trait::async_trait]
impl Worker for FortressWorker {
    fn kill(&self) {
        self.task.kill();
    }

    async fn wait(&self) -> anyhow::Result<()> {
        self.task.wait().await
    }
}

/// Manifold running a fresh [`Fortress`] and exposing its [`Guard`] and [`Guest`].
pub fn fortress_manifold(name: &str) -> Manifold {
    let worker_name = name.to_owned();
    Manifold::new(name, move |_ctx| {
        let worker_name = worker_name.clone();
        async move { Ok(FortressWorker::spawn(&worker_name)) }
    })
    .with_output(|worker: &FortressWorker| {
        Outputs::new()
            .with(worker.fortress().guard())
            .with(worker.fortress().guest())
    })
}
