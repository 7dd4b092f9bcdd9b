use serde::{Deserialize, Serialize};

use crate::{
    concurrency::ArrayBackendKind,
    error::{Result, SimulationError},
    floating_type_mod::FT,
    time_out::TimeOutEntry,
    V3, VD3,
};

/// Extra capacity requested whenever the periodic replicator runs out of space.
pub const PERIODIC_OVER_FRACTION: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAlgorithm {
    /// Leapfrog with an Euler reset every `verlet_steps` steps.
    Verlet { verlet_steps: u32 },
    /// Two-stage predictor-corrector.
    Symplectic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(default)]
    pub x: bool,
    #[serde(default)]
    pub y: bool,
    #[serde(default)]
    pub z: bool,
    /// Lattice increments. Each defaults to the domain extent along its axis.
    #[serde(default)]
    pub x_inc: Option<[f64; 3]>,
    #[serde(default)]
    pub y_inc: Option<[f64; 3]>,
    #[serde(default)]
    pub z_inc: Option<[f64; 3]>,
}

impl PeriodicConfig {
    pub fn is_active(&self) -> bool {
        self.x || self.y || self.z
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    pub step_algorithm: StepAlgorithm,

    pub time_max: f64,
    /// Default interval between output parts.
    pub time_out: f64,
    /// Optional piecewise output schedule, replaces `time_out` when not empty.
    #[serde(default)]
    pub time_out_list: Vec<TimeOutEntry>,

    /// Smoothing length. Derived from the particle spacing and `coef_h` when absent.
    #[serde(default)]
    pub h: Option<f64>,
    #[serde(default = "default_coef_h")]
    pub coef_h: f64,
    /// Cells per kernel support radius (`Scell = 2h / hdiv`).
    #[serde(default = "default_hdiv")]
    pub hdiv: u32,

    pub cfl_number: FT,
    pub speed_sound: FT,
    #[serde(default = "default_rhop0")]
    pub rhop0: FT,
    #[serde(default = "default_gamma")]
    pub gamma: FT,
    #[serde(default = "default_gravity")]
    pub gravity: [FT; 3],
    #[serde(default = "default_visco")]
    pub visco: FT,
    #[serde(default = "default_one")]
    pub visco_bound_factor: FT,

    #[serde(default)]
    pub dt_ini: Option<f64>,
    #[serde(default)]
    pub dt_min: Option<f64>,
    #[serde(default = "default_coef_dt_min")]
    pub coef_dt_min: f64,
    #[serde(default)]
    pub dt_fixed: Option<f64>,
    #[serde(default = "default_dt_modif_wrn")]
    pub dt_modif_wrn: u32,

    #[serde(default)]
    pub simulate_2d: bool,
    #[serde(default)]
    pub pos_2d_y: f64,

    #[serde(default)]
    pub domain: Option<DomainBounds>,
    /// Margin added around the particle bounding box when `domain` is absent.
    #[serde(default = "default_domain_margin")]
    pub domain_margin: f64,
    #[serde(default)]
    pub periodic: PeriodicConfig,

    #[serde(default = "default_true")]
    pub rhop_out: bool,
    #[serde(default = "default_rhop_out_min")]
    pub rhop_out_min: FT,
    #[serde(default = "default_rhop_out_max")]
    pub rhop_out_max: FT,

    /// Allowed fraction of excluded fluid particles before the run aborts.
    #[serde(default = "default_one_f32")]
    pub parts_out_max: f32,
    /// Warning threshold (percent) for particles excluded during one part.
    #[serde(default = "default_parts_out_wrn")]
    pub parts_out_wrn: u32,
    /// Warning threshold (percent) for particles excluded in total.
    #[serde(default = "default_parts_out_tot_wrn")]
    pub parts_out_tot_wrn: u32,
    #[serde(default)]
    pub np_minimum: usize,
    #[serde(default)]
    pub nsteps_break: Option<u64>,

    /// Floating bodies start moving once the simulated time reaches this value.
    #[serde(default)]
    pub ft_pause: f64,

    #[serde(default)]
    pub initial_over_fraction: f32,
    #[serde(default)]
    pub max_particle_capacity: Option<usize>,

    #[serde(default)]
    pub array_backend: ArrayBackendKind,
}

fn default_coef_h() -> f64 {
    1.0
}
fn default_hdiv() -> u32 {
    1
}
fn default_rhop0() -> FT {
    1000.
}
fn default_gamma() -> FT {
    7.
}
fn default_gravity() -> [FT; 3] {
    [0., 0., -9.81]
}
fn default_visco() -> FT {
    0.01
}
fn default_one() -> FT {
    1.
}
fn default_one_f32() -> f32 {
    1.
}
fn default_coef_dt_min() -> f64 {
    0.05
}
fn default_dt_modif_wrn() -> u32 {
    1
}
fn default_domain_margin() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_rhop_out_min() -> FT {
    700.
}
fn default_rhop_out_max() -> FT {
    1300.
}
fn default_parts_out_wrn() -> u32 {
    1
}
fn default_parts_out_tot_wrn() -> u32 {
    10
}

impl SimulationParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SimulationError::InvalidConfig(msg));

        if let StepAlgorithm::Verlet { verlet_steps } = self.step_algorithm {
            if verlet_steps == 0 {
                return invalid("verlet_steps must be at least 1".into());
            }
        }
        if !(self.time_max > 0.) {
            return invalid(format!("time_max must be positive, got {}", self.time_max));
        }
        if !(self.time_out > 0.) {
            return invalid(format!("time_out must be positive, got {}", self.time_out));
        }
        if self.hdiv == 0 {
            return invalid("hdiv must be at least 1".into());
        }
        if !(self.cfl_number > 0.) || !(self.speed_sound > 0.) || !(self.rhop0 > 0.) {
            return invalid("cfl_number, speed_sound and rhop0 must be positive".into());
        }
        if let Some(h) = self.h {
            if !(h > 0.) {
                return invalid(format!("h must be positive, got {}", h));
            }
        }
        if let Some(dt_fixed) = self.dt_fixed {
            if !(dt_fixed > 0.) {
                return invalid(format!("dt_fixed must be positive, got {}", dt_fixed));
            }
        }
        if self.rhop_out && self.rhop_out_min >= self.rhop_out_max {
            return invalid("rhop_out_min must be below rhop_out_max".into());
        }
        if self.periodic.is_active() && self.domain.is_none() {
            return invalid("periodic boundaries need explicit domain bounds".into());
        }
        if self.simulate_2d && self.periodic.y {
            return invalid("2-D simulations cannot be periodic along y".into());
        }
        if let Some(domain) = &self.domain {
            if (0..3).any(|d| !(domain.min[d] < domain.max[d])) {
                return invalid("domain.min must be below domain.max on every axis".into());
            }
        }
        if self.initial_over_fraction < 0. {
            return invalid("initial_over_fraction must not be negative".into());
        }
        let mut last = -1.;
        for entry in &self.time_out_list {
            if entry.time <= last || entry.time < 0. || !(entry.tout > 0.) {
                return invalid(format!("invalid time_out_list entry at t={}", entry.time));
            }
            last = entry.time;
        }
        Ok(())
    }

    pub fn gravity_vector(&self) -> V3 {
        V3::from_column_slice(&self.gravity)
    }

    /// Derives the run constants for a case with inter-particle spacing `dp`.
    pub fn constants(&self, dp: f64) -> Result<Constants> {
        self.validate()?;
        if !(dp > 0.) {
            return Err(SimulationError::InvalidConfig(format!(
                "particle spacing must be positive, got {}",
                dp
            )));
        }

        let h = match self.h {
            Some(h) => h,
            None if self.simulate_2d => self.coef_h * (2. * dp * dp).sqrt(),
            None => self.coef_h * (3. * dp * dp).sqrt(),
        };
        let dosh = 2. * h;
        let scell = dosh / self.hdiv as f64;
        let cs0 = self.speed_sound;
        let volume = if self.simulate_2d { dp * dp } else { dp * dp * dp };
        let mass = volume * self.rhop0 as f64;
        let dt_min = self.dt_min.unwrap_or(self.coef_dt_min * h / cs0 as f64);

        let mut gravity = self.gravity_vector();
        if self.simulate_2d {
            gravity.y = 0.;
        }

        Ok(Constants {
            dp,
            h,
            dosh,
            scell,
            hdiv: self.hdiv,
            mov_limit: scell * 0.9,
            cs0,
            rhop0: self.rhop0,
            gamma: self.gamma,
            cte_b: cs0 * cs0 * self.rhop0 / self.gamma,
            massf: mass as FT,
            massb: mass as FT,
            visco: self.visco,
            visco_bound_factor: self.visco_bound_factor,
            gravity,
            cfl_number: self.cfl_number,
            dt_ini: self.dt_ini.unwrap_or(h / cs0 as f64),
            dt_min,
            dt_fixed: self.dt_fixed,
            simulate_2d: self.simulate_2d,
            pos_2d_y: self.pos_2d_y,
            rhop_out: if self.rhop_out {
                Some((self.rhop_out_min, self.rhop_out_max))
            } else {
                None
            },
        })
    }
}

/// Values fixed for the whole run, derived once from the parameters and the case.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constants {
    pub dp: f64,
    pub h: f64,
    /// Kernel support radius (2h).
    pub dosh: f64,
    pub scell: f64,
    pub hdiv: u32,
    /// Maximum distance a particle may travel in one step.
    pub mov_limit: f64,
    pub cs0: FT,
    pub rhop0: FT,
    pub gamma: FT,
    pub cte_b: FT,
    pub massf: FT,
    pub massb: FT,
    pub visco: FT,
    pub visco_bound_factor: FT,
    pub gravity: V3,
    pub cfl_number: FT,
    pub dt_ini: f64,
    pub dt_min: f64,
    pub dt_fixed: Option<f64>,
    pub simulate_2d: bool,
    pub pos_2d_y: f64,
    pub rhop_out: Option<(FT, FT)>,
}

impl Constants {
    pub fn gravity_f64(&self) -> VD3 {
        crate::to_f64_3(&self.gravity)
    }
}
