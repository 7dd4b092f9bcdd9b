use tracing::{debug, error, info};

use crate::{
    cell_division::CellDivision,
    concurrency::ArrayBackend,
    counters::{PerformanceCounters, ValueCounters},
    domain::Domain,
    error::{Result, SimulationError},
    floating::{ExternalForcing, FloatingBody, FloatingCoupler, FloatingStep, RigidBodyBackend},
    force_evaluator::{ForceEvaluator, InteractionInput, InteractionStep},
    hooks::{HookContext, MotionHook},
    particle_code::ParticleKind,
    particle_store::{AuxArray, ParticleArrays, ParticleInit, ParticleStore},
    parts_out::PartsOut,
    periodic::PeriodicReplicator,
    simulation_parameters::{Constants, SimulationParams},
    sinks::ParticleView,
    timestep::{ace_max, vel_max, DtControl},
};

/// Particles and rigid bodies of a case, as produced by the case loader.
#[derive(Debug, Clone, Default)]
pub struct CaseData {
    /// Inter-particle spacing.
    pub dp: f64,
    pub particles: Vec<ParticleInit>,
    pub floating: Vec<FloatingBody>,
}

/// Simulated time, step size and step counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationClock {
    pub time: f64,
    pub dt: f64,
    pub nstep: u64,
}

/// Pluggable parts of a run that live outside the particle engine.
pub struct Collaborators {
    pub evaluator: Box<dyn ForceEvaluator>,
    pub rigid_backend: Option<Box<dyn RigidBodyBackend>>,
    pub forcing: Vec<Box<dyn ExternalForcing>>,
    /// Applied by the integrators after every committed step (damping, relaxation).
    pub hooks: Vec<Box<dyn MotionHook>>,
    /// Prescribed boundary motion, applied by the run loop after each step.
    pub motions: Vec<Box<dyn MotionHook>>,
}

impl Collaborators {
    pub fn new(evaluator: Box<dyn ForceEvaluator>) -> Self {
        Collaborators {
            evaluator,
            rigid_backend: None,
            forcing: Vec::new(),
            hooks: Vec::new(),
            motions: Vec::new(),
        }
    }
}

/// Extremes produced by one force evaluation, inputs of the time-step control.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InteractionSummary {
    pub acemax: f64,
    pub velmax: f64,
    pub visc_dt_max: f64,
}

/// Everything a step mutates. Owned by the run loop and handed to the
/// integrator by `&mut`.
pub struct SimulationState {
    pub store: ParticleStore,
    pub domain: Domain,
    pub constants: Constants,
    pub backend: ArrayBackend,
    pub division: CellDivision,
    pub periodic: PeriodicReplicator,
    pub dt_control: DtControl,
    pub clock: SimulationClock,
    pub parts_out: PartsOut,
    pub floating: FloatingCoupler,
    pub pcounters: PerformanceCounters,
    pub vcounters: ValueCounters,
    np_max: usize,
}

impl SimulationState {
    pub fn new(params: &SimulationParams, case: CaseData, counters_enabled: bool) -> Result<SimulationState> {
        let constants = params.constants(case.dp)?;
        let positions: Vec<_> = case.particles.iter().map(|p| p.pos).collect();
        let domain = Domain::new(params, &constants, &positions)?;

        let store = ParticleStore::from_particles(
            &case.particles,
            params.initial_over_fraction,
            params.max_particle_capacity,
        )?;
        let fluid_initial = case
            .particles
            .iter()
            .filter(|p| p.code.kind() == ParticleKind::Fluid)
            .count();
        let floating = FloatingCoupler::new(case.floating, &store, &constants, params.ft_pause)?;

        info!(
            "case: {} particles ({} boundary, {} fluid), {} floating bodies, capacity {}",
            store.np,
            store.npb,
            fluid_initial,
            floating.bodies().len(),
            store.capacity()
        );
        debug!("constants: {:?}", constants);

        Ok(SimulationState {
            np_max: store.np,
            store,
            domain,
            backend: params.array_backend.into(),
            division: CellDivision::new(),
            periodic: PeriodicReplicator::new(),
            dt_control: DtControl::new(&constants, params.dt_modif_wrn),
            clock: SimulationClock {
                time: 0.,
                dt: constants.dt_ini,
                nstep: 0,
            },
            parts_out: PartsOut::new(
                fluid_initial,
                params.parts_out_max,
                params.parts_out_wrn,
                params.parts_out_tot_wrn,
            ),
            floating,
            pcounters: PerformanceCounters::new(counters_enabled),
            vcounters: ValueCounters::new(counters_enabled),
            constants,
        })
    }

    /// Largest live particle count seen so far.
    pub fn np_max(&self) -> usize {
        self.np_max
    }

    /// Periodic pass (optional), cell division and bookkeeping of removed
    /// particles. Boundary or floating particles out of the domain abort the run.
    pub fn run_cell_divide(&mut self, update_periodic: bool) -> Result<()> {
        self.pcounters.begin("divide");
        if update_periodic && self.domain.is_periodic() {
            let stats = self.periodic.run(&mut self.store, &self.domain, &self.backend)?;
            if stats.resizes > 0 {
                // arrays were reallocated under the old partition
                self.division.invalidate();
            }
        }
        let outcome = self.division.divide(&mut self.store, &self.domain, &self.backend);

        let (floating_out, fluid_out): (Vec<_>, Vec<_>) = outcome
            .fluid_out
            .into_iter()
            .partition(|p| p.kind == ParticleKind::Floating);
        if !outcome.boundary_out.is_empty() || !floating_out.is_empty() {
            let dump: Vec<_> = outcome.boundary_out.into_iter().chain(floating_out).collect();
            error!(
                "{} boundary particle(s) left the domain at step {} (t={:.6}):",
                dump.len(),
                self.clock.nstep,
                self.clock.time
            );
            for p in &dump {
                error!("  {}", p);
            }
            return Err(SimulationError::BoundaryParticlesOut {
                nstep: self.clock.nstep,
                time: self.clock.time,
                dump,
            });
        }

        self.floating.update_ridp(&self.store);
        self.parts_out.record(&fluid_out, self.clock.nstep, self.clock.time)?;
        self.np_max = self.np_max.max(self.store.np);
        self.vcounters.add_value("np", self.store.np as f64);
        self.pcounters.end("divide");
        Ok(())
    }

    /// Allocates the force scratch arrays and evaluates forces on the current
    /// partition.
    pub fn interaction(&mut self, step: InteractionStep, evaluator: &mut dyn ForceEvaluator) -> Result<InteractionSummary> {
        self.pcounters.begin("interaction");
        self.store.allocate(AuxArray::Ace)?;
        self.store.allocate(AuxArray::Ar)?;
        let partition = self.division.partition().ok_or(SimulationError::NoPartition)?;
        let np = self.store.np;
        let npb = self.store.npb;

        let ParticleArrays {
            code,
            dcell,
            pos,
            velrhop,
            ace,
            ar,
            ..
        } = &mut self.store.arrays;
        let ace = ace.as_mut().ok_or(SimulationError::MissingBuffer("ace"))?;
        let ar = ar.as_mut().ok_or(SimulationError::MissingBuffer("ar"))?;

        let input = InteractionInput {
            step,
            np,
            npb,
            code: &code[..],
            dcell: &dcell[..],
            pos: &pos[..],
            velrhop: &velrhop[..],
            partition,
            domain: &self.domain,
            constants: &self.constants,
            backend: &self.backend,
        };
        let stats = evaluator.interact(&input, &mut ace[..np], &mut ar[..np])?;

        if self.constants.simulate_2d {
            ace[..np].iter_mut().for_each(|a| a.y = 0.);
        }
        let summary = InteractionSummary {
            acemax: ace_max(&code[..], &ace[..], npb, np, &self.backend),
            velmax: vel_max(&velrhop[..], npb, np, &self.backend),
            visc_dt_max: stats.visc_dt_max,
        };
        self.pcounters.end("interaction");
        Ok(summary)
    }

    pub fn dt_variable(&mut self, summary: &InteractionSummary, final_step: bool) -> f64 {
        self.dt_control.dt_variable(
            summary.acemax,
            summary.velmax,
            summary.visc_dt_max,
            final_step,
            self.clock.time,
            self.clock.nstep,
        )
    }

    pub fn free_scratch(&mut self) {
        self.store.free(AuxArray::Ace);
        self.store.free(AuxArray::Ar);
    }

    pub fn run_floating(&mut self, dt: f64, predictor: bool, collab: &mut Collaborators) -> Result<()> {
        if self.floating.is_empty() {
            return Ok(());
        }
        self.pcounters.begin("floating");
        let step = FloatingStep {
            time: self.clock.time,
            nstep: self.clock.nstep,
            dt,
            predictor,
        };
        self.floating.run(
            step,
            &mut self.store,
            &self.domain,
            &self.constants,
            &mut collab.rigid_backend,
            &mut collab.forcing,
        )?;
        self.pcounters.end("floating");
        Ok(())
    }

    pub fn run_hooks(&mut self, dt: f64, hooks: &mut [Box<dyn MotionHook>]) -> Result<()> {
        let ctx = HookContext {
            time: self.clock.time,
            dt,
            nstep: self.clock.nstep,
            simulate_2d: self.constants.simulate_2d,
            backend: self.backend,
        };
        for hook in hooks.iter_mut() {
            hook.apply(&ctx, &mut self.store, &self.domain, &self.constants)?;
        }
        Ok(())
    }

    /// Read-only view for gauges and output.
    pub fn particle_view(&self) -> ParticleView<'_> {
        let np = self.store.np;
        let arrays = &self.store.arrays;
        ParticleView {
            np,
            npb: self.store.npb,
            idp: &arrays.idp[..np],
            code: &arrays.code[..np],
            pos: &arrays.pos[..np],
            velrhop: &arrays.velrhop[..np],
            partition: self.division.partition(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        force_evaluator::GravityEvaluator,
        particle_code::Code,
        simulation_parameters::tests::minimal_params,
        vec3d, V4, VD3,
    };

    pub(crate) fn particle(id: u32, kind: ParticleKind, pos: VD3) -> ParticleInit {
        ParticleInit {
            id,
            code: Code::new(kind, 0),
            pos,
            velrhop: V4::new(0., 0., 0., 1000.),
        }
    }

    pub(crate) fn boxed_params() -> SimulationParams {
        let mut params = minimal_params();
        params.h = Some(0.05);
        params.domain = Some(crate::simulation_parameters::DomainBounds {
            min: [0., 0., 0.],
            max: [1., 1., 1.],
        });
        params
    }

    #[test]
    fn boundary_particle_out_is_fatal_with_dump() {
        let params = boxed_params();
        let case = CaseData {
            dp: 0.02,
            particles: vec![
                particle(0, ParticleKind::Fixed, vec3d(0.5, 0.5, 0.1)),
                particle(1, ParticleKind::Fixed, vec3d(0.5, 0.5, 0.1)),
                particle(2, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
            ],
            floating: vec![],
        };
        let mut state = SimulationState::new(&params, case, false).unwrap();
        state.run_cell_divide(true).unwrap();
        state.store.arrays.pos[1].z = -3.;
        state.clock.nstep = 7;
        match state.run_cell_divide(true) {
            Err(SimulationError::BoundaryParticlesOut { nstep, dump, .. }) => {
                assert_eq!(nstep, 7);
                assert_eq!(dump.len(), 1);
                assert_eq!(dump[0].id, 1);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fluid_particle_out_is_recorded() {
        let params = boxed_params();
        let case = CaseData {
            dp: 0.02,
            particles: vec![
                particle(0, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5)),
                particle(1, ParticleKind::Fluid, vec3d(0.6, 0.5, 0.5)),
            ],
            floating: vec![],
        };
        let mut state = SimulationState::new(&params, case, true).unwrap();
        state.run_cell_divide(true).unwrap();
        state.store.arrays.pos[0].x = f64::NAN;
        state.run_cell_divide(true).unwrap();
        assert_eq!(state.store.np, 1);
        assert_eq!(state.parts_out.total().pos, 1);
        assert_eq!(state.np_max(), 2);
        assert_eq!(state.vcounters.avg("np"), Some(1.5));
    }

    #[test]
    fn halo_copies_off_the_map_are_dropped_silently() {
        for kind in [ParticleKind::Fluid, ParticleKind::Fixed] {
            let mut params = boxed_params();
            params.periodic.x = true;
            params.periodic.x_inc = Some([1., 0., 0.1]);
            let case = CaseData {
                dp: 0.02,
                particles: vec![particle(0, kind, vec3d(0.02, 0.5, 0.95))],
                floating: vec![],
            };
            let mut state = SimulationState::new(&params, case, false).unwrap();
            for _ in 0..2 {
                state.run_cell_divide(true).unwrap();
                assert_eq!(state.store.np, 1);
                assert_eq!(state.store.npb_per + state.store.npf_per, 0);
                assert!(state.store.arrays.code[0].is_normal());
                assert_eq!(state.parts_out.total().total(), 0);
            }
        }
    }

    #[test]
    fn interaction_requires_a_partition() {
        let params = boxed_params();
        let case = CaseData {
            dp: 0.02,
            particles: vec![particle(0, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5))],
            floating: vec![],
        };
        let mut state = SimulationState::new(&params, case, false).unwrap();
        let err = state
            .interaction(InteractionStep::Verlet, &mut GravityEvaluator)
            .unwrap_err();
        assert!(matches!(err, SimulationError::NoPartition));

        state.run_cell_divide(true).unwrap();
        let summary = state.interaction(InteractionStep::Verlet, &mut GravityEvaluator).unwrap();
        assert!((summary.acemax - 9.81).abs() < 1e-5);
        assert_eq!(summary.velmax, 0.);
        state.free_scratch();
        assert!(!state.store.arrays.is_allocated(AuxArray::Ace));
    }
}
