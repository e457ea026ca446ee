//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
struct Resource {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Typed values a started manifold exposes to its dependents.
///
/// Values are keyed by Rust type; at most one value per type.
#[derive(Clone, Default)]
pub struct Outputs {
    values: HashMap<TypeId, Resource>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `value`, replacing any earlier value of the same type.
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(
            TypeId::of::<T>(),
            Resource {
                type_name: type_name::<T>(),
                value: Arc::new(value),
            },
        );
        self
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|resource| resource.value.downcast_ref::<T>())
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sorted type names, for diagnostics and mismatch errors.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.values.values().map(|r| r.type_name).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Outputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.type_names()).finish()
    }
}
