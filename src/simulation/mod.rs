pub mod cell_division;
pub mod concurrency;
pub mod counters;
pub mod domain;
pub mod error;
pub mod floating;
pub mod force_evaluator;
pub mod hooks;
pub mod initialize;
pub mod integrator;
pub mod particle_code;
pub mod particle_store;
pub mod parts_out;
pub mod periodic;
pub mod scene;
pub mod simulation;
pub mod simulation_parameters;
pub mod sinks;
pub mod sph_kernels;
pub mod state;
pub mod time_out;
pub mod timestep;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::PI;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::PI;
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

/// Velocity, acceleration and force vectors.
pub type V3 = V<FT, 3>;

/// Velocity (xyz) packed with density (w).
pub type V4 = V<FT, 4>;

/// Positions and rigid-body centres are always kept in double precision.
pub type VD3 = V<f64, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub fn vec3d(x: f64, y: f64, z: f64) -> VD3 {
    [x, y, z].into()
}

pub fn velrhop(vel: V3, rhop: FT) -> V4 {
    [vel.x, vel.y, vel.z, rhop].into()
}

pub fn vel_of(velrhop: &V4) -> V3 {
    [velrhop.x, velrhop.y, velrhop.z].into()
}

pub fn to_ft3(v: &VD3) -> V3 {
    v.map(|x| x as FT)
}

pub fn to_f64_3(v: &V3) -> VD3 {
    v.map(|x| x as f64)
}

pub use simulation::*;
