use serde::Serialize;
use tracing::warn;

use crate::{
    concurrency::{ArrayBackend, ArrayOps},
    particle_code::Code,
    simulation_parameters::Constants,
    vel_of, V3, V4,
};

/// Variable time step from the CFL condition, the force condition and the
/// viscous condition.
#[derive(Debug, Clone)]
pub struct DtControl {
    cfl_number: f64,
    h: f64,
    cs0: f64,
    dt_min: f64,
    dt_fixed: Option<f64>,
    dt_modif: u32,
    dt_modif_wrn: u32,
    part_dt_min: f64,
    part_dt_max: f64,
    run_dt_min: f64,
    run_dt_max: f64,
}

/// Extreme time steps of one output part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DtRange {
    pub min: f64,
    pub max: f64,
}

impl DtControl {
    pub fn new(constants: &Constants, dt_modif_wrn: u32) -> Self {
        DtControl {
            cfl_number: constants.cfl_number as f64,
            h: constants.h,
            cs0: constants.cs0 as f64,
            dt_min: constants.dt_min,
            dt_fixed: constants.dt_fixed,
            dt_modif: 0,
            dt_modif_wrn: dt_modif_wrn.max(1),
            part_dt_min: f64::MAX,
            part_dt_max: 0.,
            run_dt_min: f64::MAX,
            run_dt_max: 0.,
        }
    }

    pub fn dt_min(&self) -> f64 {
        self.dt_min
    }

    /// Number of steps whose dt was raised to `dt_min`.
    pub fn dt_modif(&self) -> u32 {
        self.dt_modif
    }

    /// `acemax` and `velmax` are magnitudes. Statistics are updated only for
    /// `final_step` estimates.
    pub fn dt_variable(&mut self, acemax: f64, velmax: f64, visc_dt_max: f64, final_step: bool, time: f64, nstep: u64) -> f64 {
        let h = self.h;
        let dt1 = if acemax > 0. { (h / acemax).sqrt() } else { f64::MAX };
        let dt2 = h / (self.cs0.max(velmax * 10.) + h * visc_dt_max);
        let mut dt = self.cfl_number * dt1.min(dt2);
        if let Some(dt_fixed) = self.dt_fixed {
            dt = dt_fixed;
        }
        if !(dt >= self.dt_min) {
            dt = self.dt_min;
            self.dt_modif += 1;
            if self.dt_modif >= self.dt_modif_wrn {
                warn!(
                    "{} time steps adjusted to dt_min (t:{}, nstep:{})",
                    self.dt_modif, time, nstep
                );
                self.dt_modif_wrn = self.dt_modif_wrn.saturating_mul(10);
            }
        }
        if final_step {
            self.part_dt_min = self.part_dt_min.min(dt);
            self.part_dt_max = self.part_dt_max.max(dt);
        }
        dt
    }

    /// Returns the extremes since the previous call and starts a new part.
    pub fn finish_part(&mut self) -> Option<DtRange> {
        if self.part_dt_max == 0. {
            return None;
        }
        let range = DtRange {
            min: self.part_dt_min,
            max: self.part_dt_max,
        };
        self.run_dt_min = self.run_dt_min.min(range.min);
        self.run_dt_max = self.run_dt_max.max(range.max);
        self.part_dt_min = f64::MAX;
        self.part_dt_max = 0.;
        Some(range)
    }

    /// Extremes over all finished parts.
    pub fn run_range(&self) -> Option<DtRange> {
        if self.run_dt_max == 0. {
            None
        } else {
            Some(DtRange {
                min: self.run_dt_min,
                max: self.run_dt_max,
            })
        }
    }
}

/// Largest acceleration magnitude in the fluid block, halo copies excluded.
pub fn ace_max(code: &[Code], ace: &[V3], npb: usize, np: usize, backend: &ArrayBackend) -> f64 {
    backend.reduce_max(np - npb, |k| {
        let i = npb + k;
        if code[i].is_periodic() {
            0.
        } else {
            ace[i].norm() as f64
        }
    })
}

/// Largest speed in the fluid block.
pub fn vel_max(velrhop: &[V4], npb: usize, np: usize, backend: &ArrayBackend) -> f64 {
    backend.reduce_max(np - npb, |k| vel_of(&velrhop[npb + k]).norm() as f64)
}
