//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::DependencyError;

/// Upcast helper so engine callers can recover a concrete worker type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A long-running unit of work owned by the engine.
///
/// `kill` must return promptly and may be called any number of times.
/// `wait` resolves once the worker has fully stopped and may also be called
/// repeatedly; every caller observes the same outcome.
#[async_trait]
pub trait Worker: AsAny + Send + Sync {
    /// Request cooperative termination.
    fn kill(&self);

    /// Block until the worker has terminated.
    async fn wait(&self) -> anyhow::Result<()>;
}

impl dyn Worker {
    /// Borrow the concrete worker behind a trait object.
    pub fn downcast_ref<W: Worker>(&self) -> Option<&W> {
        AsAny::as_any(self).downcast_ref::<W>()
    }
}

/// Stop request observed by a [`TaskWorker`] body.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the worker has been killed or dropped.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Clean,
    Failed {
        signal: Option<DependencyError>,
        message: String,
    },
}

impl Outcome {
    fn from_error(err: &anyhow::Error) -> Self {
        Outcome::Failed {
            signal: DependencyError::find(err).cloned(),
            message: format!("{:#}", err),
        }
    }

    fn replay(&self) -> anyhow::Result<()> {
        match self {
            Outcome::Clean => Ok(()),
            Outcome::Failed {
                signal: Some(signal),
                message,
            } if *message == signal.to_string() => Err(anyhow::Error::new(signal.clone())),
            Outcome::Failed {
                signal: Some(signal),
                message,
            } => Err(anyhow::Error::new(signal.clone()).context(message.clone())),
            Outcome::Failed {
                signal: None,
                message,
            } => Err(anyhow!("{}", message)),
        }
    }
}

/// Worker backed by a spawned tokio task.
///
/// The body receives a [`StopSignal`] and should return once it fires. A
/// panicking body is reported as a fatal error.
pub struct TaskWorker {
    name: String,
    stop_tx: watch::Sender<bool>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl TaskWorker {
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let future = body(StopSignal { rx: stop_rx });
        let task_name = name.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(worker = %task_name, "worker finished");
                    Outcome::Clean
                }
                Ok(Err(err)) => {
                    debug!(worker = %task_name, error = %format!("{:#}", err), "worker finished with error");
                    Outcome::from_error(&err)
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(worker = %task_name, reason = %reason, "worker panicked");
                    let signal = DependencyError::Fatal(format!("worker panicked: {}", reason));
                    Outcome::Failed {
                        message: signal.to_string(),
                        signal: Some(signal),
                    }
                }
            };
            outcome_tx.send_replace(Some(outcome));
        });
        Self {
            name,
            stop_tx,
            outcome: outcome_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the body has returned.
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

#[async_trait]
impl Worker for TaskWorker {
    fn kill(&self) {
        self.stop_tx.send_replace(true);
    }

    async fn wait(&self) -> anyhow::Result<()> {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(outcome) => outcome.replay(),
            None => Err(anyhow!("worker {} vanished without reporting", self.name)),
        }
    }
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
