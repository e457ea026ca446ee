//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use thiserror::Error;

/// Result alias used by the dependency engine's public surface.
pub type Result<T> = std::result::Result<T, DependencyError>;

/// Malformed graph or undeclared coupling between manifolds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A manifold was registered without a name.
    #[error("manifold name must not be empty")]
    EmptyName,
    /// A manifold name was registered twice.
    #[error("manifold {0:?} is already registered")]
    Duplicate(String),
    /// A manifold listed itself among its inputs.
    #[error("manifold {0:?} lists itself as an input")]
    SelfInput(String),
    /// A manifold listed the same input more than once.
    #[error("manifold {name:?} lists input {input:?} more than once")]
    DuplicateInput {
        /// Manifold being registered.
        name: String,
        /// Repeated input name.
        input: String,
    },
    /// An input refers to a manifold that was never registered.
    #[error("manifold {name:?} depends on unknown manifold {input:?}")]
    UnknownInput {
        /// Manifold declaring the input.
        name: String,
        /// Input that does not exist in the graph.
        input: String,
    },
    /// The inputs form a cycle; members are listed in registration order.
    #[error("dependency cycle between {}", .0.join(", "))]
    Cycle(Vec<String>),
    /// A start function queried an input it did not declare.
    #[error("manifold {name:?} did not declare input {input:?}")]
    UndeclaredInput {
        /// Manifold whose context was queried.
        name: String,
        /// Input that was requested.
        input: String,
    },
    /// An output was requested from a manifold that is not part of the graph.
    #[error("no manifold named {0:?}")]
    UnknownManifold(String),
}

/// Errors and distinguished signals understood by the engine.
///
/// Workers and start functions return `anyhow::Result`; the engine walks the
/// error chain looking for one of these variants to decide what happens next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// Graph configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The queried manifold is not currently started.
    #[error("manifold {0:?} is not available")]
    NotAvailable(String),
    /// A start function could not run because something it needs is absent.
    #[error("dependency not available")]
    Missing,
    /// The requested output type is not exposed by the manifold.
    #[error("manifold {manifold:?} does not expose {requested} (exposes: {})", .available.join(", "))]
    TypeMismatch {
        /// Manifold that was queried.
        manifold: String,
        /// Rust type name that was requested.
        requested: &'static str,
        /// Type names the manifold does expose.
        available: Vec<&'static str>,
    },
    /// Restart now: dependents must observe a new value.
    #[error("restart immediately")]
    Bounce,
    /// The node is no longer needed and must never be restarted.
    #[error("resource permanently unavailable")]
    Uninstall,
    /// Unrecoverable failure; the node is parked in the error state.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Workers that ignored a stop request past the configured timeout.
    #[error("workers did not stop in time: {}", .0.join(", "))]
    StopTimeout(Vec<String>),
    /// The engine loop terminated without publishing its final state.
    #[error("engine loop exited unexpectedly")]
    EngineGone,
}

impl DependencyError {
    /// Wrap any error so the engine treats it as fatal.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        DependencyError::Fatal(err.to_string())
    }

    /// Find the first engine signal anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&DependencyError> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<DependencyError>())
    }

    /// Whether the error chain carries the given signal.
    pub fn is(err: &anyhow::Error, signal: &DependencyError) -> bool {
        DependencyError::find(err).is_some_and(|found| found == signal)
    }
}

/// How the engine reacts to a start or worker result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Stopped without error: not restarted until an input changes.
    Clean,
    /// Something needed is absent: treated like an unmet dependency.
    Missing,
    /// Restart without counting a failure.
    Bounce,
    /// Remove the node for the rest of the run.
    Uninstall,
    /// Park the node in the error state.
    Fatal(String),
    /// Ordinary failure: retried with backoff.
    Failure(String),
}

impl Disposition {
    pub(crate) fn of(err: &anyhow::Error) -> Self {
        match DependencyError::find(err) {
            Some(DependencyError::Bounce) => Disposition::Bounce,
            Some(DependencyError::Missing) | Some(DependencyError::NotAvailable(_)) => {
                Disposition::Missing
            }
            Some(DependencyError::Uninstall) => Disposition::Uninstall,
            Some(DependencyError::Fatal(_))
            | Some(DependencyError::Config(_))
            | Some(DependencyError::TypeMismatch { .. }) => Disposition::Fatal(format!("{:#}", err)),
            _ => Disposition::Failure(format!("{:#}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn signals_are_found_through_context() {
        let err = anyhow::Error::new(DependencyError::Bounce).context("flag changed");
        assert!(DependencyError::is(&err, &DependencyError::Bounce));
        assert_eq!(Disposition::of(&err), Disposition::Bounce);
    }

    #[test]
    fn plain_errors_are_failures() {
        let err = anyhow!("connection refused");
        assert!(DependencyError::find(&err).is_none());
        assert_eq!(
            Disposition::of(&err),
            Disposition::Failure("connection refused".into())
        );
    }

    #[test]
    fn not_available_counts_as_missing() {
        let result: anyhow::Result<()> =
            Err(DependencyError::NotAvailable("api-caller".into())).context("starting firewaller");
        let err = result.expect_err("error expected");
        assert_eq!(Disposition::of(&err), Disposition::Missing);
    }

    #[test]
    fn config_errors_are_fatal() {
        let err = anyhow::Error::new(DependencyError::from(ConfigError::UndeclaredInput {
            name: "worker".into(),
            input: "clock".into(),
        }));
        assert!(matches!(Disposition::of(&err), Disposition::Fatal(_)));
    }

    #[test]
    fn cycle_message_lists_members() {
        let err = ConfigError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "dependency cycle between a, b");
    }
}
