//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Model agent topologies.
//!
//! Each topology is a fixed table of manifolds wired through flags, the
//! upgrade gate and the migration fortress. Workers the topology does not
//! implement itself come from a [`Collaborators`] factory.

pub mod collaborators;
pub mod conditions;
pub mod manifolds;
pub mod migration;
pub mod names;

pub use collaborators::{Agent, Clock, Collaborators, Environ, IdleCollaborators, SharedClock, WallClock};
pub use conditions::{ApiConnection, Conditions};
pub use manifolds::{cluster_manifolds, manifolds, standalone_manifolds, Manifolds, ManifoldsConfig};
pub use migration::migration_master_manifold;
