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

use fleet_dependency::{Context, DependencyError, Manifold, StartFn, Worker};
use futures::FutureExt;
use tracing::debug;

use crate::flag::Flag;
use crate::fortress::{FortressError, Guest};

/// Decorator adding run conditions to a manifold.
///
/// Every flag named here becomes an input that must be set for the decorated
/// start to run; otherwise the start reports [`DependencyError::Missing`].
/// With `occupy`, the worker runs inside a visit to the named fortress for
/// its whole lifetime, so a lockdown waits for it to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Housing {
    pub flags: Vec<String>,
    pub occupy: Option<String>,
}

impl Housing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn occupying(mut self, fortress: impl Into<String>) -> Self {
        self.occupy = Some(fortress.into());
        self
    }

    pub fn decorate(&self, manifold: Manifold) -> Manifold {
        let mut inputs = manifold.inputs().to_vec();
        for extra in self.flags.iter().chain(self.occupy.iter()) {
            if !inputs.contains(extra) {
                inputs.push(extra.clone());
            }
        }

        let inner = manifold.start_fn();
        let flags = Arc::new(self.flags.clone());
        let occupy = self.occupy.clone();
        let start: StartFn = Arc::new(move |ctx: Context| {
            let inner = Arc::clone(&inner);
            let flags = Arc::clone(&flags);
            let occupy = occupy.clone();
            async move {
                for flag in flags.iter() {
                    let Flag(set) = ctx.get::<Flag>(flag)?;
                    if !set {
                        debug!(manifold = %ctx.name(), flag = %flag, "flag not set");
                        return Err(DependencyError::Missing.into());
                    }
                }
                match occupy {
                    Some(fortress) => occupy_start(&fortress, inner, ctx).await,
                    None => inner(ctx).await,
                }
            }
            .boxed()
        });

        manifold.with_start(start).with_inputs(inputs)
    }
}

/// Start the worker inside a fortress visit held until the worker stops.
async fn occupy_start(
    fortress: &str,
    inner: StartFn,
    ctx: Context,
) -> anyhow::Result<Arc<dyn Worker>> {
    let guest: Guest = ctx.get(fortress)?;
    let visit = guest.enter().map_err(|err| match err {
        FortressError::Aborted => {
            debug!(manifold = %ctx.name(), fortress = %fortress, "fortress locked");
            anyhow::Error::new(DependencyError::Missing).context(err)
        }
        FortressError::Shutdown => anyhow::Error::new(err),
    })?;
    let worker = inner(ctx).await?;
    let occupant = Arc::clone(&worker);
    tokio::spawn(async move {
        let _ = occupant.wait().await;
        drop(visit);
    });
    Ok(worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fortress::{Fortress, FortressMode};
    use fleet_dependency::{Outputs, TaskWorker};
    use std::time::Duration;
    use tokio::time::timeout;

    fn idle(name: &'static str) -> Manifold {
        Manifold::new(name, move |_ctx| async move {
            Ok(TaskWorker::spawn(name, |stop| async move {
                stop.stopped().await;
                Ok(())
            }))
        })
        .with_inputs(["agent"])
    }

    fn flags(responsible: bool) -> Vec<(String, Outputs)> {
        vec![
            ("agent".to_owned(), Outputs::new()),
            (
                "is-responsible-flag".to_owned(),
                Outputs::new().with(Flag(responsible)),
            ),
            ("not-dead-flag".to_owned(), Outputs::new().with(Flag(true))),
        ]
    }

    #[test]
    fn inputs_are_added_once() {
        let housing = Housing::new()
            .with_flags(["is-responsible-flag", "agent"])
            .occupying("migration-fortress");
        let manifold = housing.decorate(idle("worker"));
        assert_eq!(
            manifold.inputs(),
            ["agent", "is-responsible-flag", "migration-fortress"]
        );
    }

    #[tokio::test]
    async fn unset_flags_report_missing() {
        let housing = Housing::new().with_flags(["is-responsible-flag", "not-dead-flag"]);
        let manifold = housing.decorate(idle("worker"));

        let (ctx, _abort) = Context::new(&manifold, flags(false));
        let err = manifold.start(ctx).await.err().expect("missing");
        assert!(DependencyError::is(&err, &DependencyError::Missing));

        let (ctx, _abort) = Context::new(&manifold, flags(true));
        let worker = manifold.start(ctx).await.expect("starts");
        worker.kill();
        worker.wait().await.expect("clean stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn occupants_hold_the_fortress_until_they_stop() {
        let fortress = Fortress::new();
        let manifold = Housing::new()
            .occupying("migration-fortress")
            .decorate(idle("worker"));
        let resources = vec![
            ("agent".to_owned(), Outputs::new()),
            (
                "migration-fortress".to_owned(),
                Outputs::new().with(fortress.guest()),
            ),
        ];

        let (ctx, _abort) = Context::new(&manifold, resources.clone());
        let worker = manifold.start(ctx).await.expect("starts inside visit");
        assert_eq!(fortress.visitors(), 1);

        let locking = {
            let guard = fortress.guard();
            tokio::spawn(async move { guard.lockdown(std::future::pending()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fortress.mode(), FortressMode::LockingDown);

        let (ctx, _abort) = Context::new(&manifold, resources);
        let err = manifold.start(ctx).await.err().expect("refused");
        assert!(DependencyError::is(&err, &DependencyError::Missing));

        worker.kill();
        timeout(Duration::from_secs(1), locking)
            .await
            .expect("lockdown completes")
            .expect("lockdown task")
            .expect("locked");
        assert_eq!(fortress.mode(), FortressMode::Locked);
    }
}
