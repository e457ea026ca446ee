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
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::Context;
use crate::output::Outputs;
use crate::worker::{AsAny, Worker};

/// Type-erased start function.
pub type StartFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>> + Send + Sync>;
/// Type-erased output function.
pub type OutputFn = Arc<dyn Fn(&dyn Worker) -> anyhow::Result<Outputs> + Send + Sync>;
/// Error filter: `None` suppresses the error entirely.
pub type FilterFn = Arc<dyn Fn(anyhow::Error) -> Option<anyhow::Error> + Send + Sync>;

/// Declarative description of one node in the dependency graph.
///
/// A manifold names its inputs, knows how to start a worker from a
/// [`Context`], and optionally exposes typed outputs from the running worker
/// and rewrites the errors that worker produces.
#[derive(Clone)]
pub struct Manifold {
    name: String,
    inputs: Vec<String>,
    start: StartFn,
    output: Option<OutputFn>,
    filter: Option<FilterFn>,
}

impl Manifold {
    /// Manifold whose start function produces a concrete worker type.
    pub fn new<W, F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        W: Worker,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<W>> + Send + 'static,
    {
        let start = Arc::new(start);
        Self::from_start(
            name,
            Arc::new(move |ctx: Context| {
                let start = Arc::clone(&start);
                async move {
                    let worker = start(ctx).await?;
                    Ok::<Arc<dyn Worker>, anyhow::Error>(Arc::new(worker))
                }
                .boxed()
            }),
        )
    }

    /// Manifold built around an already type-erased start function.
    pub fn from_start(name: impl Into<String>, start: StartFn) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            start,
            output: None,
            filter: None,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Expose outputs computed from the running worker of type `W`.
    pub fn with_output<W, F>(self, output: F) -> Self
    where
        W: Worker,
        F: Fn(&W) -> Outputs + Send + Sync + 'static,
    {
        self.with_output_fn(Arc::new(move |worker: &dyn Worker| {
            AsAny::as_any(worker)
                .downcast_ref::<W>()
                .map(&output)
                .ok_or_else(|| anyhow!("expected worker of type {}", type_name::<W>()))
        }))
    }

    pub fn with_output_fn(mut self, output: OutputFn) -> Self {
        self.output = Some(output);
        self
    }

    /// Rewrite or suppress errors from start and from the worker.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(anyhow::Error) -> Option<anyhow::Error> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Replace the start function, keeping name, inputs, output and filter.
    pub fn with_start(mut self, start: StartFn) -> Self {
        self.start = start;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn start_fn(&self) -> StartFn {
        Arc::clone(&self.start)
    }

    pub fn start(&self, ctx: Context) -> BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>> {
        (self.start)(ctx)
    }

    /// Outputs of a running worker; empty when the manifold exposes none.
    pub fn output(&self, worker: &dyn Worker) -> anyhow::Result<Outputs> {
        match &self.output {
            Some(output) => output(worker),
            None => Ok(Outputs::new()),
        }
    }

    pub(crate) fn filter(&self, err: anyhow::Error) -> Option<anyhow::Error> {
        match &self.filter {
            Some(filter) => filter(err),
            None => Some(err),
        }
    }
}

impl std::fmt::Debug for Manifold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifold")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("output", &self.output.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DependencyError;
    use crate::worker::TaskWorker;

    fn idle(name: &'static str) -> Manifold {
        Manifold::new(name, move |_ctx| async move {
            Ok(TaskWorker::spawn(name, |stop| async move {
                stop.stopped().await;
                Ok(())
            }))
        })
    }

    #[tokio::test]
    async fn outputs_come_from_the_concrete_worker() {
        let manifold = idle("agent").with_output(|worker: &TaskWorker| {
            Outputs::new().with(worker.name().to_owned())
        });
        let (ctx, _abort) = Context::new(&manifold, []);
        let worker = manifold.start(ctx).await.expect("starts");
        let outputs = manifold.output(worker.as_ref()).expect("outputs");
        assert_eq!(outputs.get::<String>(), Some("agent".to_owned()));
        worker.kill();
        worker.wait().await.expect("clean");
    }

    #[tokio::test]
    async fn output_rejects_foreign_workers() {
        struct Other;
        #[async_trait::async_trait]
        impl Worker for Other {
            fn kill(&self) {}
            async fn wait(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let manifold = idle("agent").with_output(|_: &Other| Outputs::new());
        let (ctx, _abort) = Context::new(&manifold, []);
        let worker = manifold.start(ctx).await.expect("starts");
        assert!(manifold.output(worker.as_ref()).is_err());
        worker.kill();
    }

    #[test]
    fn filter_can_suppress_and_rewrite() {
        let manifold = idle("flag").with_filter(|err| {
            if DependencyError::is(&err, &DependencyError::Missing) {
                None
            } else {
                Some(anyhow::Error::new(DependencyError::Bounce))
            }
        });
        assert!(manifold
            .filter(anyhow::Error::new(DependencyError::Missing))
            .is_none());
        let rewritten = manifold.filter(anyhow!("boom")).expect("kept");
        assert!(DependencyError::is(&rewritten, &DependencyError::Bounce));
        assert!(idle("plain").filter(anyhow!("boom")).is_some());
    }
}
