use serde::{Deserialize, Serialize};

use crate::{
    concurrency::{ArrayBackend, ArrayOps},
    domain::Domain,
    error::Result,
    floating_type_mod::FT,
    integrator::update_pos,
    particle_code::ParticleKind,
    particle_store::ParticleStore,
    simulation_parameters::Constants,
    to_f64_3, vel_of, velrhop, V3, VD3,
};

#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    pub time: f64,
    pub dt: f64,
    pub nstep: u64,
    pub simulate_2d: bool,
    pub backend: ArrayBackend,
}

/// Modifies particle motion at a fixed point of the step, after the
/// integrator committed it.
pub trait MotionHook {
    fn apply(&mut self, ctx: &HookContext, store: &mut ParticleStore, domain: &Domain, constants: &Constants) -> Result<()>;
}

fn default_redu_max() -> f64 {
    10.
}

fn default_factor() -> [FT; 3] {
    [1., 1., 1.]
}

/// Progressively slows fluid down past the plane through `limit_min` whose
/// normal points towards `limit_max`. Full strength is reached at `limit_max`
/// and kept for `over_limit` beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DampingZone {
    pub limit_min: [f64; 3],
    pub limit_max: [f64; 3],
    #[serde(default)]
    pub over_limit: f64,
    #[serde(default = "default_redu_max")]
    pub redu_max: f64,
    #[serde(default = "default_factor")]
    pub factor: [FT; 3],
}

impl MotionHook for DampingZone {
    fn apply(&mut self, ctx: &HookContext, store: &mut ParticleStore, _domain: &Domain, _constants: &Constants) -> Result<()> {
        let min = VD3::from(self.limit_min);
        let span = VD3::from(self.limit_max) - min;
        let dist = span.norm();
        if dist == 0. {
            return Ok(());
        }
        let normal = span / dist;
        let over = self.over_limit;
        let redu_max = self.redu_max;
        let factor = V3::from(self.factor);
        let dt = ctx.dt;

        let (npb, np) = (store.npb, store.np);
        let arrays = &mut store.arrays;
        let pos = &arrays.pos;
        let code = &arrays.code;
        ctx.backend.for_each_mut1(&mut arrays.velrhop[npb..np], |k, vr| {
            let i = npb + k;
            if code[i].kind() != ParticleKind::Fluid || code[i].is_periodic() {
                return;
            }
            let vdis = normal.dot(&(pos[i] - min));
            if !(vdis > 0. && vdis <= dist + over) {
                return;
            }
            let fdis = (vdis / dist).min(1.);
            let redudt = (dt * fdis * fdis * redu_max).min(1.) as FT;
            let vel = vel_of(vr).component_mul(&factor.map(|f| (1. - redudt * f).max(0.)));
            *vr = velrhop(vel, vr.w);
        });
        Ok(())
    }
}

/// Rectilinear motion of the moving boundary with mk value `mkbound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingBoundary {
    pub mkbound: u16,
    pub velocity: [FT; 3],
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: Option<f64>,
}

impl MovingBoundary {
    fn is_active(&self, time: f64) -> bool {
        time >= self.start && self.end.map_or(true, |end| time < end)
    }
}

impl MotionHook for MovingBoundary {
    fn apply(&mut self, ctx: &HookContext, store: &mut ParticleStore, domain: &Domain, constants: &Constants) -> Result<()> {
        let mut vel = if self.is_active(ctx.time) {
            V3::from(self.velocity)
        } else {
            V3::zeros()
        };
        if ctx.simulate_2d {
            vel.y = 0.;
        }
        let dx = to_f64_3(&vel) * ctx.dt;
        let mkbound = self.mkbound;
        let npb = store.npb;
        let mov_limit = constants.mov_limit;
        let arrays = &mut store.arrays;
        ctx.backend.for_each_mut3(
            &mut arrays.pos[..npb],
            &mut arrays.code[..npb],
            &mut arrays.velrhop[..npb],
            |_, pos, code, vr| {
                if code.kind() != ParticleKind::Moving || code.mk_value() != mkbound || code.is_periodic() {
                    return;
                }
                if dx != VD3::zeros() {
                    update_pos(pos, code, dx, false, domain, mov_limit);
                }
                *vr = velrhop(vel, vr.w);
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell_division::{tests::store_from, CellDivision},
        concurrency::SerialBackend,
        domain::tests::unit_box,
        particle_code::Code,
        vec3d, V4,
    };

    fn ctx(time: f64, dt: f64) -> HookContext {
        HookContext {
            time,
            dt,
            nstep: 0,
            simulate_2d: false,
            backend: SerialBackend.into(),
        }
    }

    #[test]
    fn damping_scales_with_depth_into_the_zone() {
        let (domain, constants) = unit_box(false, false);
        let mut store = store_from(&[
            (ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.75, 0.5, 0.5)),
            (ParticleKind::Fluid, vec3d(0.95, 0.5, 0.5)),
        ]);
        for vr in &mut store.arrays.velrhop[..3] {
            *vr = V4::new(1., 0., 1., 1000.);
        }
        let mut zone = DampingZone {
            limit_min: [0.7, 0., 0.],
            limit_max: [0.9, 0., 0.],
            over_limit: 0.1,
            redu_max: 10.,
            factor: [1., 1., 0.],
        };
        zone.apply(&ctx(0., 0.01), &mut store, &domain, &constants).unwrap();
        let vr = &store.arrays.velrhop;
        assert_eq!(vr[0], V4::new(1., 0., 1., 1000.));
        // quarter depth: 1 - 0.01 * 0.0625 * 10
        assert!((vr[1].x - (1. - 0.00625)).abs() < 1e-6);
        assert!((vr[2].x - 0.9).abs() < 1e-6);
        assert_eq!(vr[2].z, 1.);
    }

    #[test]
    fn moving_boundary_moves_only_its_particles_inside_the_window() {
        let (domain, constants) = unit_box(false, false);
        let mut store = store_from(&[
            (ParticleKind::Moving, vec3d(0.5, 0.5, 0.2)),
            (ParticleKind::Moving, vec3d(0.5, 0.5, 0.3)),
            (ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
        ]);
        store.arrays.code[0] = Code::new(ParticleKind::Moving, 4);
        CellDivision::new().divide(&mut store, &domain, &SerialBackend.into());
        let mut motion = MovingBoundary {
            mkbound: 4,
            velocity: [0.5, 0., 0.],
            start: 0.1,
            end: Some(0.2),
        };

        motion.apply(&ctx(0.05, 0.01), &mut store, &domain, &constants).unwrap();
        let moved = store.arrays.idp.iter().position(|&id| id == 0).unwrap();
        assert_eq!(store.arrays.pos[moved].x, 0.5);

        motion.apply(&ctx(0.15, 0.01), &mut store, &domain, &constants).unwrap();
        assert!((store.arrays.pos[moved].x - 0.505).abs() < 1e-12);
        assert_eq!(store.arrays.velrhop[moved].x, 0.5);
        let other = store.arrays.idp.iter().position(|&id| id == 1).unwrap();
        assert_eq!(store.arrays.pos[other].x, 0.5);

        motion.apply(&ctx(0.25, 0.01), &mut store, &domain, &constants).unwrap();
        assert_eq!(store.arrays.velrhop[moved].x, 0.);
    }
}
