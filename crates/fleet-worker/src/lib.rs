//! ---
//! fleet_section: "04-worker-helpers"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reusable workers and manifold decorators."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Building blocks shared by model topologies: the migration [`Fortress`],
//! boolean [`Flag`] manifolds, the one-way upgrade [`Gate`] and the
//! [`Housing`] decorator that gates workers on flags and fortress visits.

pub mod flag;
pub mod fortress;
pub mod gate;
pub mod housing;

pub use flag::{flag_manifold, Flag, FlagWorker, SourceFn};
pub use fortress::{
    fortress_manifold, Fortress, FortressError, FortressMode, FortressWorker, Guard, Guest, Visit,
};
pub use gate::{gate_flag_manifold, gate_manifold, Gate, Unlocker, Waiter};
pub use housing::Housing;
