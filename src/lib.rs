// Some query-heavy numerical routines take a large number of arguments;
// splitting them would only obscure the call sequence.
#![allow(clippy::too_many_arguments)]

//! # bfexp
//! A parallel, time-stepped N-body integrator built around biorthogonal
//! basis-function force evaluation. Each particle population (a
//! [`Component`](component::Component)) projects its instantaneous
//! distribution onto a precomputed potential–density basis, and forces
//! are read back from the expansion coefficients instead of pairwise
//! sums.
//!
//! Two geometries are provided: a spherical Sturm–Liouville basis for
//! pressure-supported populations and an empirical cylindrical basis for
//! disks, built by conditioning a 3-D spherical basis on a target
//! density and cached on disk. Coefficients support hierarchical
//! ("multistep") time levels with continuous interpolation, and an
//! optional signal-to-noise smoother denoises them from their sample
//! covariance.
//!
//! Ranks communicate through a small trait layer with two backends: real
//! MPI (`mpi` feature) and a channel-backed world that runs every rank
//! as a thread of one process (`local`, the default), which is how the
//! test suite exercises the collective paths.

pub mod communication;
pub mod component;
pub mod config;
pub mod cylindrical;
pub mod diagnostics;
pub mod error;
pub mod force;
pub mod io;
pub mod math;
pub mod multistep;
pub mod particle;
pub mod pca;
pub mod radial;
pub mod simulation;
pub mod spherical;

#[cfg(test)]
pub(crate) mod test_utils;

/// `use bfexp::prelude::*` for the types a driver binary needs.
pub mod prelude {
    pub use crate::component::Component;
    pub use crate::config::SimulationConfig;
    pub use crate::error::Error;
    pub use crate::force::Force;
    pub use crate::particle::Particle;
    pub use crate::simulation::Comms;
    pub use crate::simulation::Simulation;
    pub use crate::simulation::SimulationBuilder;
}
