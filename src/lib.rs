/*!
Particle engine of a weakly compressible SPH solver: cell division, periodic
halos, Verlet and Symplectic time stepping and floating-body coupling.
*/

mod platform;
pub mod simulation;

pub use platform::start;
pub use simulation::*;
