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
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{ConfigError, DependencyError, Result};
use crate::manifold::Manifold;
use crate::output::Outputs;

/// Read-only view handed to a start function.
///
/// Holds the outputs of the manifold's declared inputs as they were when the
/// start was issued, plus an abort signal raised if the engine no longer
/// wants this start to complete.
#[derive(Clone)]
pub struct Context {
    name: Arc<str>,
    inputs: Arc<[String]>,
    resources: Arc<HashMap<String, Outputs>>,
    abort: watch::Receiver<bool>,
}

/// Engine side of a [`Context`] abort signal.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// Build a context for `manifold` from the given input outputs.
    ///
    /// Entries for names the manifold did not declare are ignored.
    pub fn new(
        manifold: &Manifold,
        resources: impl IntoIterator<Item = (String, Outputs)>,
    ) -> (Self, AbortHandle) {
        let inputs: Arc<[String]> = manifold.inputs().to_vec().into();
        let resources = resources
            .into_iter()
            .filter(|(name, _)| inputs.iter().any(|input| input == name))
            .collect();
        let (tx, abort) = watch::channel(false);
        (
            Self {
                name: Arc::from(manifold.name()),
                inputs,
                resources: Arc::new(resources),
                abort,
            },
            AbortHandle { tx },
        )
    }

    /// Name of the manifold being started.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch an output of type `T` from a declared input.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, input: &str) -> Result<T> {
        if !self.inputs.iter().any(|declared| declared == input) {
            return Err(ConfigError::UndeclaredInput {
                name: self.name.to_string(),
                input: input.to_owned(),
            }
            .into());
        }
        let outputs = self
            .resources
            .get(input)
            .ok_or_else(|| DependencyError::NotAvailable(input.to_owned()))?;
        outputs
            .get::<T>()
            .ok_or_else(|| DependencyError::TypeMismatch {
                manifold: input.to_owned(),
                requested: type_name::<T>(),
                available: outputs.type_names(),
            })
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once the engine abandons this start.
    pub async fn aborted(&self) {
        let mut rx = self.abort.clone();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
