use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, SimulationError},
    floating_type_mod::FT,
    particle_code::ParticleKind,
    particle_store::ParticleInit,
    velrhop, V3,
};

/// Speed as a function of height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VelocityProfile {
    Constant { v: FT },
    /// Linear through `(z1, v1)` and `(z2, v2)`.
    Linear { v1: FT, z1: f64, v2: FT, z2: f64 },
    /// Parabola through three `(z, v)` points.
    Parabolic {
        v1: FT,
        z1: f64,
        v2: FT,
        z2: f64,
        v3: FT,
        z3: f64,
    },
}

/// Initial fluid velocity along `direction`, optionally restricted to some mk values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidVelocity {
    pub direction: [FT; 3],
    pub profile: VelocityProfile,
    #[serde(default)]
    pub mk_fluid: Vec<u16>,
}

impl FluidVelocity {
    /// `[a, b, c]` with `v(z) = a z^2 + b z + c`.
    fn coefficients(&self) -> Result<[f64; 3]> {
        match self.profile {
            VelocityProfile::Constant { v } => Ok([0., 0., v as f64]),
            VelocityProfile::Linear { v1, z1, v2, z2 } => {
                if z1 == z2 {
                    return Err(SimulationError::InvalidConfig(
                        "linear velocity profile needs two distinct heights".into(),
                    ));
                }
                let m = (v2 as f64 - v1 as f64) / (z2 - z1);
                Ok([0., m, v1 as f64 - m * z1])
            }
            VelocityProfile::Parabolic { v1, z1, v2, z2, v3, z3 } => {
                let m = Matrix3::new(z1 * z1, z1, 1., z2 * z2, z2, 1., z3 * z3, z3, 1.);
                let inv = m.try_inverse().ok_or_else(|| {
                    SimulationError::InvalidConfig("parabolic velocity profile needs three distinct heights".into())
                })?;
                let abc = inv * Vector3::new(v1 as f64, v2 as f64, v3 as f64);
                Ok([abc.x, abc.y, abc.z])
            }
        }
    }

    /// Sets the velocity of matching fluid particles and returns how many were changed.
    pub fn apply(&self, particles: &mut [ParticleInit]) -> Result<usize> {
        let dir = V3::from(self.direction);
        let norm = dir.norm();
        if norm == 0. {
            return Err(SimulationError::InvalidConfig("fluid velocity direction is zero".into()));
        }
        let dir = dir / norm;
        let [a, b, c] = self.coefficients()?;

        let mut count = 0;
        for p in particles
            .iter_mut()
            .filter(|p| p.code.kind() == ParticleKind::Fluid)
            .filter(|p| self.mk_fluid.is_empty() || self.mk_fluid.contains(&p.code.mk_value()))
        {
            let z = p.pos.z;
            let v = (a * z * z + b * z + c) as FT;
            p.velrhop = velrhop(dir * v, p.velrhop.w);
            count += 1;
        }
        info!("initial fluid velocity set on {} particles", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{particle_code::Code, vec3d, V4};

    fn fluid_column(mk: u16) -> Vec<ParticleInit> {
        (0..5)
            .map(|k| ParticleInit {
                id: k,
                code: Code::new(ParticleKind::Fluid, mk),
                pos: vec3d(0., 0., k as f64 * 0.25),
                velrhop: V4::new(0., 0., 0., 1000.),
            })
            .collect()
    }

    #[test]
    fn linear_profile_interpolates_height() {
        let mut particles = fluid_column(0);
        let init = FluidVelocity {
            direction: [2., 0., 0.],
            profile: VelocityProfile::Linear {
                v1: 0.,
                z1: 0.,
                v2: 1.,
                z2: 1.,
            },
            mk_fluid: vec![],
        };
        assert_eq!(init.apply(&mut particles).unwrap(), 5);
        for p in &particles {
            assert!((p.velrhop.x as f64 - p.pos.z).abs() < 1e-6);
            assert_eq!(p.velrhop.w, 1000.);
        }
    }

    #[test]
    fn parabolic_profile_hits_its_points() {
        let mut particles = fluid_column(3);
        let init = FluidVelocity {
            direction: [0., 1., 0.],
            profile: VelocityProfile::Parabolic {
                v1: 0.,
                z1: 0.,
                v2: 1.,
                z2: 0.5,
                v3: 0.,
                z3: 1.,
            },
            mk_fluid: vec![3],
        };
        init.apply(&mut particles).unwrap();
        assert!(particles[0].velrhop.y.abs() < 1e-6);
        assert!((particles[2].velrhop.y - 1.).abs() < 1e-5);
        assert!((particles[1].velrhop.y - 0.75).abs() < 1e-5);

        let mut others = fluid_column(1);
        assert_eq!(init.apply(&mut others).unwrap(), 0);
    }

    #[test]
    fn degenerate_profiles_are_rejected() {
        let init = FluidVelocity {
            direction: [1., 0., 0.],
            profile: VelocityProfile::Parabolic {
                v1: 0.,
                z1: 0.,
                v2: 1.,
                z2: 0.,
                v3: 0.,
                z3: 1.,
            },
            mk_fluid: vec![],
        };
        assert!(init.apply(&mut fluid_column(0)).is_err());
    }
}
