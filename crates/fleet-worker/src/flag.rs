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

use fleet_dependency::{Context, DependencyError, Manifold, Outputs, TaskWorker, Worker};
use tokio::sync::watch;
use tracing::debug;

/// Boolean condition published by flag manifolds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flag(pub bool);

impl Flag {
    pub fn is_set(&self) -> bool {
        self.0
    }
}

/// Worker holding a flag value fixed for its lifetime.
pub struct FlagWorker {
    value: bool,
    task: TaskWorker,
}

impl FlagWorker {
    /// Publish `predicate(source)` and bounce as soon as it flips.
    ///
    /// Changes of the source that leave the predicate unchanged are ignored.
    /// A closed source keeps the current value until the worker is killed.
    pub fn spawn<T, P>(name: &str, mut source: watch::Receiver<T>, predicate: P) -> Self
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let value = predicate(&source.borrow_and_update());
        let flag = name.to_owned();
        let task = TaskWorker::spawn(name, move |stop| async move {
            loop {
                tokio::select! {
                    _ = stop.stopped() => return Ok(()),
                    changed = source.changed() => {
                        if changed.is_err() {
                            stop.stopped().await;
                            return Ok(());
                        }
                        let current = predicate(&source.borrow_and_update());
                        if current != value {
                            debug!(flag = %flag, from = value, to = current, "flag changed");
                            return Err(DependencyError::Bounce.into());
                        }
                    }
                }
            }
        });
        Self { value, task }
    }

    pub fn value(&self) -> bool {
        self.value
    }
}

#[async_trait::async_trait]
impl Worker for FlagWorker {
    fn kill(&self) {
        self.task.kill();
    }

    async fn wait(&self) -> anyhow::Result<()> {
        self.task.wait().await
    }
}

/// Locates the watched condition for a flag once its inputs are available.
pub type SourceFn<T> =
    Arc<dyn Fn(&Context) -> anyhow::Result<watch::Receiver<T>> + Send + Sync>;

/// Manifold exposing [`Flag`] derived from a watched condition.
pub fn flag_manifold<T, P>(
    name: &str,
    inputs: &[&str],
    source: SourceFn<T>,
    predicate: P,
) -> Manifold
where
    T: Send + Sync + 'static,
    P: Fn(&T) -> bool + Clone + Send + Sync + 'static,
{
    let flag = name.to_owned();
    Manifold::new(name, move |ctx: Context| {
        let flag = flag.clone();
        let source = Arc::clone(&source);
        let predicate = predicate.clone();
        async move {
            let receiver = source(&ctx)?;
            Ok(FlagWorker::spawn(&flag, receiver, predicate))
        }
    })
    .with_inputs(inputs.iter().copied())
    .with_output(|worker: &FlagWorker| Outputs::new().with(Flag(worker.value())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Life {
        Alive,
        Dying,
        Dead,
    }

    fn not_dead(source: watch::Receiver<Life>) -> Manifold {
        flag_manifold(
            "not-dead-flag",
            &[],
            Arc::new(move |_ctx: &Context| -> anyhow::Result<watch::Receiver<Life>> {
                Ok(source.clone())
            }),
            |life: &Life| *life != Life::Dead,
        )
    }

    #[tokio::test]
    async fn exposes_initial_value() {
        let (_tx, rx) = watch::channel(Life::Alive);
        let manifold = not_dead(rx);
        let (ctx, _abort) = Context::new(&manifold, []);
        let worker = manifold.start(ctx).await.expect("starts");
        let outputs = manifold.output(worker.as_ref()).expect("outputs");
        assert_eq!(outputs.get::<Flag>(), Some(Flag(true)));
        worker.kill();
        worker.wait().await.expect("clean stop");
    }

    #[tokio::test]
    async fn ignores_changes_that_keep_the_value() {
        let (tx, rx) = watch::channel(Life::Alive);
        let manifold = not_dead(rx);
        let (ctx, _abort) = Context::new(&manifold, []);
        let worker = manifold.start(ctx).await.expect("starts");
        tx.send_replace(Life::Dying);
        assert!(timeout(Duration::from_millis(50), worker.wait())
            .await
            .is_err());

        tx.send_replace(Life::Dead);
        let err = timeout(Duration::from_secs(1), worker.wait())
            .await
            .expect("bounced")
            .expect_err("bounce is an error");
        assert!(DependencyError::is(&err, &DependencyError::Bounce));
    }
}
