use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, SimulationError},
    floating::{ConstraintMask, ExternalForcing, FloatingBody, SpringMooring, VelocitySeries},
    floating_type_mod::FT,
    hooks::{DampingZone, MotionHook, MovingBoundary},
    initialize::FluidVelocity,
    particle_code::{Code, ParticleKind},
    particle_store::ParticleInit,
    simulation_parameters::SimulationParams,
    state::CaseData,
    V4, VD3,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFluidBlock {
    pub min: [f64; 3],
    pub max: [f64; 3],
    #[serde(default)]
    pub mk: u16,
    #[serde(default)]
    pub velocity: [FT; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneBoundaryBlock {
    pub min: [f64; 3],
    pub max: [f64; 3],
    #[serde(default = "default_fixed")]
    pub kind: ParticleKind,
    #[serde(default)]
    pub mk: u16,
    /// Only the faces of the box are filled.
    #[serde(default)]
    pub hollow: bool,
    /// Leaves out the top face of a hollow box.
    #[serde(default)]
    pub open_top: bool,
}

fn default_fixed() -> ParticleKind {
    ParticleKind::Fixed
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFloatingBlock {
    pub mkbound: u16,
    pub min: [f64; 3],
    pub max: [f64; 3],
    /// Either the body density or its total mass.
    #[serde(default)]
    pub density: Option<f64>,
    #[serde(default)]
    pub mass: Option<f64>,
    #[serde(default)]
    pub velocity: [FT; 3],
    #[serde(default)]
    pub constraints: ConstraintMask,
    #[serde(default)]
    pub linear_velocity: Option<VelocitySeries>,
    #[serde(default)]
    pub angular_velocity: Option<VelocitySeries>,
    /// Motion is delegated to the rigid-body backend.
    #[serde(default)]
    pub external: bool,
}

/// Case description: particle blocks plus the optional collaborators that act on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub dp: f64,
    #[serde(default)]
    pub fluid: Vec<SceneFluidBlock>,
    #[serde(default)]
    pub boundary: Vec<SceneBoundaryBlock>,
    #[serde(default)]
    pub floating: Vec<SceneFloatingBlock>,
    #[serde(default)]
    pub initialize: Vec<FluidVelocity>,
    #[serde(default)]
    pub damping: Vec<DampingZone>,
    #[serde(default)]
    pub motions: Vec<MovingBoundary>,
    #[serde(default)]
    pub moorings: Vec<SpringMooring>,
}

/// A case ready to run together with the collaborators it configures.
pub struct SceneSetup {
    pub case: CaseData,
    pub hooks: Vec<Box<dyn MotionHook>>,
    pub motions: Vec<Box<dyn MotionHook>>,
    pub forcing: Vec<Box<dyn ExternalForcing>>,
}

/// Lattice points with spacing `dp` covering `[min, max]`, both ends included.
fn lattice(min: VD3, max: VD3, dp: f64, y_2d: Option<f64>) -> (Vec<VD3>, [usize; 3]) {
    let count = |d: usize| {
        let n = (max[d] - min[d]) / dp + 1e-6;
        if n < 0. {
            0
        } else {
            n.floor() as usize + 1
        }
    };
    let n = [count(0), if y_2d.is_some() { 1 } else { count(1) }, count(2)];
    let mut points = Vec::with_capacity(n[0] * n[1] * n[2]);
    for k in 0..n[2] {
        for j in 0..n[1] {
            for i in 0..n[0] {
                let y = y_2d.unwrap_or(min.y + j as f64 * dp);
                points.push(VD3::new(min.x + i as f64 * dp, y, min.z + k as f64 * dp));
            }
        }
    }
    (points, n)
}

fn hollow_box(min: VD3, max: VD3, dp: f64, y_2d: Option<f64>, open_top: bool) -> Vec<VD3> {
    let (points, n) = lattice(min, max, dp, y_2d);
    let is_2d = y_2d.is_some();
    points
        .into_iter()
        .enumerate()
        .filter(|&(idx, _)| {
            let i = idx % n[0];
            let j = (idx / n[0]) % n[1];
            let k = idx / (n[0] * n[1]);
            i == 0 || i + 1 == n[0] || (!is_2d && (j == 0 || j + 1 == n[1])) || k == 0 || (!open_top && k + 1 == n[2])
        })
        .map(|(_, p)| p)
        .collect()
}

fn check_mk(mk: u16) -> Result<u16> {
    if mk > Code::MAX_MK_VALUE {
        return Err(SimulationError::InvalidConfig(format!(
            "mk value {} exceeds {}",
            mk,
            Code::MAX_MK_VALUE
        )));
    }
    Ok(mk)
}

impl SceneConfig {
    pub fn build(&self, params: &SimulationParams) -> Result<SceneSetup> {
        if !(self.dp > 0.) {
            return Err(SimulationError::InvalidConfig(format!(
                "scene dp must be positive, got {}",
                self.dp
            )));
        }
        let dp = self.dp;
        let y_2d = params.simulate_2d.then(|| params.pos_2d_y);
        let volume = if params.simulate_2d { dp * dp } else { dp * dp * dp };
        let rhop0 = params.rhop0;

        let mut particles = Vec::new();
        let push = |particles: &mut Vec<ParticleInit>, code: Code, pos: VD3, vel: [FT; 3]| {
            let id = particles.len() as u32;
            particles.push(ParticleInit {
                id,
                code,
                pos,
                velrhop: V4::new(vel[0], vel[1], vel[2], rhop0),
            });
        };

        for block in &self.boundary {
            if !block.kind.is_boundary() {
                return Err(SimulationError::InvalidConfig(format!(
                    "boundary block with mk {} must be Fixed or Moving",
                    block.mk
                )));
            }
            let code = Code::new(block.kind, check_mk(block.mk)?);
            let (min, max) = (VD3::from(block.min), VD3::from(block.max));
            let points = if block.hollow {
                hollow_box(min, max, dp, y_2d, block.open_top)
            } else {
                lattice(min, max, dp, y_2d).0
            };
            for p in points {
                push(&mut particles, code, p, [0.; 3]);
            }
        }

        let mut bodies = Vec::with_capacity(self.floating.len());
        for block in &self.floating {
            let code = Code::new(ParticleKind::Floating, check_mk(block.mkbound)?);
            let (points, _) = lattice(VD3::from(block.min), VD3::from(block.max), dp, y_2d);
            let particle_mass = match (block.density, block.mass) {
                (Some(density), None) => density * volume,
                (None, Some(mass)) if !points.is_empty() => mass / points.len() as f64,
                _ => {
                    return Err(SimulationError::InvalidConfig(format!(
                        "floating body {} needs exactly one of density or mass",
                        block.mkbound
                    )))
                }
            };
            let id_begin = particles.len() as u32;
            let mut body = FloatingBody::from_particles(block.mkbound, id_begin, &points, particle_mass)?;
            body.vel = block.velocity.into();
            body.constraints = block.constraints;
            body.linear_velocity = block.linear_velocity.clone();
            body.angular_velocity = block.angular_velocity.clone();
            body.external = block.external;
            for p in points {
                push(&mut particles, code, p, block.velocity);
            }
            bodies.push(body);
        }

        for block in &self.fluid {
            let code = Code::new(ParticleKind::Fluid, check_mk(block.mk)?);
            for p in lattice(VD3::from(block.min), VD3::from(block.max), dp, y_2d).0 {
                push(&mut particles, code, p, block.velocity);
            }
        }

        for init in &self.initialize {
            init.apply(&mut particles)?;
        }

        info!(
            "scene: {} particles, {} floating bodies, dp={}",
            particles.len(),
            bodies.len(),
            dp
        );

        Ok(SceneSetup {
            case: CaseData {
                dp,
                particles,
                floating: bodies,
            },
            hooks: self
                .damping
                .iter()
                .cloned()
                .map(|d| Box::new(d) as Box<dyn MotionHook>)
                .collect(),
            motions: self
                .motions
                .iter()
                .cloned()
                .map(|m| Box::new(m) as Box<dyn MotionHook>)
                .collect(),
            forcing: self
                .moorings
                .iter()
                .cloned()
                .map(|m| Box::new(m) as Box<dyn ExternalForcing>)
                .collect(),
        })
    }
}
