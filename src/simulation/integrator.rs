use enum_dispatch::enum_dispatch;
use tracing::trace;

use crate::{
    concurrency::ArrayOps,
    domain::Domain,
    error::{Result, SimulationError},
    floating_type_mod::FT,
    force_evaluator::InteractionStep,
    particle_code::{Code, Special},
    particle_store::{AuxArray, ParticleArrays},
    simulation_parameters::StepAlgorithm,
    state::{Collaborators, SimulationState},
    to_f64_3, vel_of, velrhop, VD3,
};

/// Moves a particle by `dx` and flags it when the move is not admissible.
///
/// The position is wrapped across periodic faces. A particle that ends up
/// outside the map is `OutPos`, one that moved more than `mov_limit` is
/// `OutMove`, and `out_rhop` marks a density out of range, in that order of
/// precedence.
pub fn update_pos(pos: &mut VD3, code: &mut Code, dx: VD3, out_rhop: bool, domain: &Domain, mov_limit: f64) {
    let mut p = *pos + dx;
    if code.is_periodic() {
        // halo copies are rebuilt by the next periodic pass, never excluded
        if domain.cell_of(&p).is_none() {
            *code = code.with_special(Special::Ignore);
        }
        *pos = p;
        return;
    }
    let out_move = dx.norm_squared() > mov_limit * mov_limit;
    domain.wrap_periodic(&mut p);
    let out_pos = domain.cell_of(&p).is_none();
    *pos = p;
    if out_pos {
        *code = code.with_special(Special::OutPos);
    } else if out_move {
        *code = code.with_special(Special::OutMove);
    } else if out_rhop {
        *code = code.with_special(Special::OutRhop);
    }
}

fn rhop_out_of_range(rhop: FT, limits: Option<(FT, FT)>) -> bool {
    match limits {
        Some((min, max)) => !(rhop >= min && rhop <= max),
        None => false,
    }
}

#[enum_dispatch]
pub trait TimeIntegrator {
    /// Allocates the integrator's history arrays. Called once after the first division.
    fn prepare(&mut self, state: &mut SimulationState) -> Result<()>;

    /// Advances every real particle by one step and returns the `dt` used.
    fn compute_step(&mut self, state: &mut SimulationState, collab: &mut Collaborators) -> Result<f64>;
}

/// Leapfrog with one-step-lagged velocity and density, reset by an Euler step
/// every `verlet_steps` steps.
#[derive(Debug, Clone)]
pub struct VerletIntegrator {
    verlet_steps: u32,
    verlet_step: u32,
}

/// Predictor-corrector with half-step prediction from the stored pre-step state.
#[derive(Debug, Clone)]
pub struct SymplecticIntegrator {
    dt_pre: f64,
}

#[enum_dispatch(TimeIntegrator)]
#[derive(Debug, Clone)]
pub enum Integrator {
    VerletIntegrator,
    SymplecticIntegrator,
}

impl Integrator {
    pub fn new(algorithm: StepAlgorithm) -> Integrator {
        match algorithm {
            StepAlgorithm::Verlet { verlet_steps } => VerletIntegrator {
                verlet_steps: verlet_steps.max(1),
                verlet_step: 0,
            }
            .into(),
            StepAlgorithm::Symplectic => SymplecticIntegrator { dt_pre: 0. }.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Integrator::VerletIntegrator(_) => "Verlet",
            Integrator::SymplecticIntegrator(_) => "Symplectic",
        }
    }
}

impl VerletIntegrator {
    fn update(&mut self, state: &mut SimulationState, dt: f64) -> Result<()> {
        self.verlet_step += 1;
        let euler = self.verlet_step >= self.verlet_steps;
        if euler {
            self.verlet_step = 0;
        }
        let dt2 = if euler { dt } else { 2. * dt };
        let dtsq_05 = 0.5 * dt * dt;
        trace!("verlet update dt={} euler={}", dt, euler);

        let np = state.store.np;
        let npb = state.store.npb;
        let c = state.constants;
        let domain = &state.domain;
        let ParticleArrays {
            code,
            pos,
            velrhop: vr,
            velrhop_m1,
            ace,
            ar,
            ..
        } = &mut state.store.arrays;
        let vr_m1 = velrhop_m1
            .as_mut()
            .ok_or(SimulationError::MissingBuffer("velrhop_m1"))?;
        let ace = ace.as_deref().ok_or(SimulationError::MissingBuffer("ace"))?;
        let ar = ar.as_deref().ok_or(SimulationError::MissingBuffer("ar"))?;

        state.backend.for_each_mut4(
            &mut pos[..np],
            &mut code[..np],
            &mut vr[..np],
            &mut vr_m1[..np],
            |i, pos, code, vr, vr_m1| {
                if code.is_periodic() {
                    return;
                }
                let old = *vr;
                let base = if euler { old } else { *vr_m1 };
                let rhop = base.w + (dt2 as FT) * ar[i];
                *vr_m1 = old;

                if i < npb {
                    *vr = velrhop(vel_of(&old), rhop.max(c.rhop0));
                    return;
                }
                if code.is_floating() {
                    *vr = velrhop(vel_of(&old), rhop);
                    return;
                }

                let a = ace[i];
                let mut vel = vel_of(&base) + a * dt2 as FT;
                let mut dx = to_f64_3(&vel_of(&old)) * dt + to_f64_3(&a) * dtsq_05;
                if c.simulate_2d {
                    vel.y = 0.;
                    dx.y = 0.;
                }
                update_pos(pos, code, dx, rhop_out_of_range(rhop, c.rhop_out), domain, c.mov_limit);
                *vr = velrhop(vel, rhop);
            },
        );
        Ok(())
    }
}

impl TimeIntegrator for VerletIntegrator {
    fn prepare(&mut self, state: &mut SimulationState) -> Result<()> {
        state.store.allocate(AuxArray::VelrhopM1)?;
        let np = state.store.np;
        let arrays = &mut state.store.arrays;
        if let Some(m1) = arrays.velrhop_m1.as_mut() {
            m1[..np].copy_from_slice(&arrays.velrhop[..np]);
        }
        self.verlet_step = 0;
        Ok(())
    }

    fn compute_step(&mut self, state: &mut SimulationState, collab: &mut Collaborators) -> Result<f64> {
        let summary = state.interaction(InteractionStep::Verlet, collab.evaluator.as_mut())?;
        let dt = state.dt_variable(&summary, true);
        state.pcounters.begin("integrate");
        self.update(state, dt)?;
        state.pcounters.end("integrate");
        state.run_floating(dt, false, collab)?;
        state.free_scratch();
        state.run_hooks(dt, &mut collab.hooks)?;
        Ok(dt)
    }
}

impl SymplecticIntegrator {
    /// `dt` that the next step will use.
    pub fn dt_pre(&self) -> f64 {
        self.dt_pre
    }

    fn save_pre_state(state: &mut SimulationState) -> Result<()> {
        state.store.allocate(AuxArray::PosPre)?;
        state.store.allocate(AuxArray::VelrhopPre)?;
        let np = state.store.np;
        let ParticleArrays {
            pos,
            velrhop,
            pos_pre,
            velrhop_pre,
            ..
        } = &mut state.store.arrays;
        let pos_pre = pos_pre.as_mut().ok_or(SimulationError::MissingBuffer("pos_pre"))?;
        let velrhop_pre = velrhop_pre
            .as_mut()
            .ok_or(SimulationError::MissingBuffer("velrhop_pre"))?;
        pos_pre[..np].copy_from_slice(&pos[..np]);
        velrhop_pre[..np].copy_from_slice(&velrhop[..np]);
        Ok(())
    }

    fn predictor_update(state: &mut SimulationState, dt: f64) -> Result<()> {
        let dt05 = 0.5 * dt;
        let np = state.store.np;
        let npb = state.store.npb;
        let c = state.constants;
        let domain = &state.domain;
        let ParticleArrays {
            code,
            pos,
            velrhop: vr,
            velrhop_pre,
            ace,
            ar,
            ..
        } = &mut state.store.arrays;
        let vr_pre = velrhop_pre
            .as_deref()
            .ok_or(SimulationError::MissingBuffer("velrhop_pre"))?;
        let ace = ace.as_deref().ok_or(SimulationError::MissingBuffer("ace"))?;
        let ar = ar.as_deref().ok_or(SimulationError::MissingBuffer("ar"))?;

        state
            .backend
            .for_each_mut3(&mut pos[..np], &mut code[..np], &mut vr[..np], |i, pos, code, vr| {
                if code.is_periodic() {
                    return;
                }
                let pre = vr_pre[i];
                let rhop = pre.w + ar[i] * dt05 as FT;
                if i < npb {
                    *vr = velrhop(vel_of(&pre), rhop.max(c.rhop0));
                    return;
                }
                if code.is_floating() {
                    *vr = velrhop(vel_of(&pre), rhop);
                    return;
                }
                let mut vel = vel_of(&pre) + ace[i] * dt05 as FT;
                let mut dx = to_f64_3(&vel_of(&pre)) * dt05;
                if c.simulate_2d {
                    vel.y = 0.;
                    dx.y = 0.;
                }
                update_pos(pos, code, dx, rhop_out_of_range(rhop, c.rhop_out), domain, c.mov_limit);
                *vr = velrhop(vel, rhop);
            });
        Ok(())
    }

    fn corrector_update(state: &mut SimulationState, dt: f64) -> Result<()> {
        let dt05 = 0.5 * dt;
        let np = state.store.np;
        let npb = state.store.npb;
        let c = state.constants;
        let domain = &state.domain;
        let ParticleArrays {
            code,
            pos,
            velrhop: vr,
            pos_pre,
            velrhop_pre,
            ace,
            ar,
            ..
        } = &mut state.store.arrays;
        let pos_pre = pos_pre.as_deref().ok_or(SimulationError::MissingBuffer("pos_pre"))?;
        let vr_pre = velrhop_pre
            .as_deref()
            .ok_or(SimulationError::MissingBuffer("velrhop_pre"))?;
        let ace = ace.as_deref().ok_or(SimulationError::MissingBuffer("ace"))?;
        let ar = ar.as_deref().ok_or(SimulationError::MissingBuffer("ar"))?;

        state
            .backend
            .for_each_mut3(&mut pos[..np], &mut code[..np], &mut vr[..np], |i, pos, code, vr| {
                if code.is_periodic() {
                    return;
                }
                let pre = vr_pre[i];
                let eps = -(ar[i] / vr.w) * dt as FT;
                let rhop = pre.w * (2. - eps) / (2. + eps);
                if i < npb {
                    *vr = velrhop(vel_of(vr), rhop.max(c.rhop0));
                    return;
                }
                if code.is_floating() {
                    *pos = pos_pre[i];
                    *vr = velrhop(vel_of(&pre), rhop);
                    return;
                }
                let mut vel = vel_of(&pre) + ace[i] * dt as FT;
                let mut dx = to_f64_3(&(vel_of(&pre) + vel)) * dt05;
                if c.simulate_2d {
                    vel.y = 0.;
                    dx.y = 0.;
                }
                *pos = pos_pre[i];
                update_pos(pos, code, dx, rhop_out_of_range(rhop, c.rhop_out), domain, c.mov_limit);
                *vr = velrhop(vel, rhop);
            });
        Ok(())
    }
}

impl TimeIntegrator for SymplecticIntegrator {
    fn prepare(&mut self, state: &mut SimulationState) -> Result<()> {
        self.dt_pre = state.constants.dt_ini;
        Ok(())
    }

    fn compute_step(&mut self, state: &mut SimulationState, collab: &mut Collaborators) -> Result<f64> {
        let dt = self.dt_pre;

        // predictor
        Self::save_pre_state(state)?;
        let summary = state.interaction(InteractionStep::SymPredictor, collab.evaluator.as_mut())?;
        let dt_p = state.dt_variable(&summary, false);
        state.pcounters.begin("integrate");
        Self::predictor_update(state, dt)?;
        state.pcounters.end("integrate");
        state.run_floating(0.5 * dt, true, collab)?;
        state.free_scratch();

        // corrector
        state.run_cell_divide(true)?;
        let summary = state.interaction(InteractionStep::SymCorrector, collab.evaluator.as_mut())?;
        let dt_c = state.dt_variable(&summary, true);
        state.pcounters.begin("integrate");
        Self::corrector_update(state, dt)?;
        state.pcounters.end("integrate");
        state.run_floating(dt, false, collab)?;
        state.store.free(AuxArray::PosPre);
        state.store.free(AuxArray::VelrhopPre);
        state.free_scratch();
        state.run_hooks(dt, &mut collab.hooks)?;

        self.dt_pre = dt_p.min(dt_c);
        trace!("symplectic dt={} next={} (predictor {} corrector {})", dt, self.dt_pre, dt_p, dt_c);
        Ok(dt)
    }
}
