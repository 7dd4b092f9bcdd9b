use std::fmt::Display;

use num_traits::Float;
use tracing::{info, warn};

use crate::{
    counters::write_statistics,
    error::Result,
    integrator::{Integrator, TimeIntegrator},
    sinks::{GaugeSink, PartData, PartSink, RunSummary, StopReason},
    simulation_parameters::SimulationParams,
    state::{CaseData, Collaborators, SimulationState},
    time_out::TimeOut,
};

/// Top-level run loop: owns the state, the integrator and the output sinks.
pub struct Simulation {
    pub state: SimulationState,
    pub collab: Collaborators,
    integrator: Integrator,
    time_out: TimeOut,
    time_max: f64,
    np_minimum: usize,
    nsteps_break: Option<u64>,
    part: u32,
    time_part_next: f64,
    sink: Box<dyn PartSink>,
    gauges: Vec<Box<dyn GaugeSink>>,
}

impl Simulation {
    /// Builds the state, partitions it once and writes the initial part.
    pub fn new(
        params: &SimulationParams,
        case: CaseData,
        collab: Collaborators,
        sink: Box<dyn PartSink>,
        counters_enabled: bool,
    ) -> Result<Simulation> {
        let mut state = SimulationState::new(params, case, counters_enabled)?;
        let time_out = if params.time_out_list.is_empty() {
            TimeOut::constant(params.time_out)?
        } else {
            TimeOut::from_entries(&params.time_out_list)?
        };

        state.run_cell_divide(true)?;
        let mut integrator = Integrator::new(params.step_algorithm);
        integrator.prepare(&mut state)?;
        info!(
            "{} integrator, time_max={} dt_ini={}",
            integrator.name(),
            params.time_max,
            state.constants.dt_ini
        );

        let mut simulation = Simulation {
            state,
            collab,
            integrator,
            time_out,
            time_max: params.time_max,
            np_minimum: params.np_minimum,
            nsteps_break: params.nsteps_break,
            part: 0,
            time_part_next: 0.,
            sink,
            gauges: Vec::new(),
        };
        simulation.save_part()?;
        Ok(simulation)
    }

    pub fn add_gauge(&mut self, gauge: Box<dyn GaugeSink>) {
        self.gauges.push(gauge);
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    /// Number of parts written so far.
    pub fn parts(&self) -> u32 {
        self.part
    }

    /// Steps until `time_max`, the step limit or particle collapse. A fatal
    /// error still finishes the sink with the last complete output before it
    /// is returned.
    pub fn run(&mut self) -> Result<RunSummary> {
        let reason = loop {
            match self.step() {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(e) => {
                    let summary = self.summary(StopReason::Failed(e.to_string()));
                    if let Err(sink_err) = self.sink.finish(&summary) {
                        warn!("finishing output after failure: {}", sink_err);
                    }
                    return Err(e);
                }
            }
        };
        let summary = self.summary(reason);
        info!(
            "run finished ({:?}) at t={:.6} after {} steps, {} parts, {} divisions, {} periodic passes",
            summary.stop_reason,
            summary.time,
            summary.nstep,
            summary.parts,
            self.state.division.num_divisions(),
            self.state.periodic.num_passes()
        );
        self.sink.finish(&summary)?;
        Ok(summary)
    }

    /// Advances one step and returns why the run should stop, if it should.
    pub fn step(&mut self) -> Result<Option<StopReason>> {
        if self.state.clock.time >= self.time_max {
            return Ok(Some(StopReason::TimeMax));
        }
        self.state.pcounters.begin("simulation-step");

        let dt = self.integrator.compute_step(&mut self.state, &mut self.collab)?;
        self.state.clock.dt = dt;

        if !self.gauges.is_empty() {
            let time = self.state.clock.time + dt;
            let nstep = self.state.clock.nstep;
            let view = self.state.particle_view();
            for gauge in self.gauges.iter_mut() {
                gauge.sample(time, nstep, &view)?;
            }
        }
        if !self.collab.motions.is_empty() {
            self.state.run_hooks(dt, &mut self.collab.motions)?;
        }
        self.state.run_cell_divide(true)?;

        self.state.clock.time += dt;
        self.state.clock.nstep += 1;
        self.state.pcounters.end("simulation-step");
        self.state.vcounters.add_value("dt", dt);

        let np = self.state.store.np;
        let mut stop = None;
        if np == 0 || np < self.np_minimum {
            warn!(
                "particle count {} fell below the minimum of {} at t={:.6}",
                np, self.np_minimum, self.state.clock.time
            );
            stop = Some(StopReason::ParticlesOutLimit);
        } else if self.nsteps_break.map_or(false, |n| self.state.clock.nstep >= n) {
            stop = Some(StopReason::StepLimit);
        }

        if self.state.clock.time >= self.time_part_next || stop.is_some() {
            self.save_part()?;
        }
        if stop.is_none() && self.state.clock.time >= self.time_max {
            stop = Some(StopReason::TimeMax);
        }
        Ok(stop)
    }

    fn save_part(&mut self) -> Result<()> {
        let state = &mut self.state;
        let (excluded, excluded_counts) = state.parts_out.take_part();
        let dt_range = state.dt_control.finish_part();
        let floating = state.floating.summary().to_vec();
        let data = PartData {
            part: self.part,
            time: state.clock.time,
            nstep: state.clock.nstep,
            view: state.particle_view(),
            dt_range,
            excluded,
            excluded_counts,
            floating,
        };
        self.sink.save_part(&data)?;
        info!(
            "part {} t={:.6} nstep={} np={} (real {}) excluded={}",
            data.part,
            data.time,
            data.nstep,
            data.view.np,
            state.store.num_real(),
            excluded_counts.total()
        );

        self.part += 1;
        self.time_part_next = self.time_out.next_time(state.clock.time);
        Ok(())
    }

    fn summary(&self, stop_reason: StopReason) -> RunSummary {
        let state = &self.state;
        RunSummary {
            stop_reason,
            nstep: state.clock.nstep,
            time: state.clock.time,
            parts: self.part,
            np_final: state.store.np,
            np_max: state.np_max(),
            max_capacity: state.store.max_capacity(),
            resize_count: state.store.resize_count(),
            dt_range: state.dt_control.run_range(),
            dt_modif: state.dt_control.dt_modif(),
            excluded: state.parts_out.total(),
            statistics: state
                .pcounters
                .is_enabled()
                .then(|| write_statistics(&state.pcounters, &state.vcounters)),
        }
    }
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        error::SimulationError,
        force_evaluator::GravityEvaluator,
        hooks::MovingBoundary,
        particle_code::{Code, ParticleKind},
        sinks::ParticleView,
        state::tests::{boxed_params, particle},
        vec3d, V4,
    };

    #[derive(Default)]
    struct Recorded {
        parts: Vec<(u32, f64, usize)>,
        summary: Option<RunSummary>,
    }

    struct RecordingSink(Rc<RefCell<Recorded>>);

    impl PartSink for RecordingSink {
        fn save_part(&mut self, part: &PartData) -> Result<()> {
            self.0.borrow_mut().parts.push((part.part, part.time, part.view.np));
            Ok(())
        }

        fn finish(&mut self, summary: &RunSummary) -> Result<()> {
            self.0.borrow_mut().summary = Some(summary.clone());
            Ok(())
        }
    }

    struct CountingGauge(Rc<RefCell<Vec<f64>>>);

    impl GaugeSink for CountingGauge {
        fn sample(&mut self, time: f64, _nstep: u64, view: &ParticleView) -> Result<()> {
            assert!(view.real_particles().count() > 0);
            self.0.borrow_mut().push(time);
            Ok(())
        }
    }

    fn simulation(params: &SimulationParams, particles: Vec<crate::particle_store::ParticleInit>) -> (Simulation, Rc<RefCell<Recorded>>) {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        let case = CaseData {
            dp: 0.02,
            particles,
            floating: vec![],
        };
        let sim = Simulation::new(
            params,
            case,
            Collaborators::new(Box::new(GravityEvaluator)),
            Box::new(RecordingSink(recorded.clone())),
            true,
        )
        .unwrap();
        (sim, recorded)
    }

    #[test]
    fn runs_to_time_max_and_writes_scheduled_parts() {
        let mut params = boxed_params();
        params.time_max = 0.02;
        params.time_out = 0.01;
        let (mut sim, recorded) = simulation(&params, vec![particle(0, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5))]);
        let samples = Rc::new(RefCell::new(Vec::new()));
        sim.add_gauge(Box::new(CountingGauge(samples.clone())));

        let summary = sim.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::TimeMax);
        assert!(summary.time >= 0.02);
        assert_eq!(summary.np_final, 1);
        assert!(summary.statistics.is_some());
        assert_eq!(samples.borrow().len() as u64, summary.nstep);

        let recorded = recorded.borrow();
        let times: Vec<f64> = recorded.parts.iter().map(|p| p.1).collect();
        assert_eq!(times[0], 0.);
        assert_eq!(recorded.parts.len(), 3);
        assert!(times[1] >= 0.01 && times[1] < 0.02);
        assert_eq!(recorded.summary.as_ref().unwrap().parts, 3);
        assert_eq!(sim.parts(), 3);

        // free fall, v = g t
        let vz = sim.state.store.arrays.velrhop[0].z as f64;
        assert_ft_approx_eq(vz, -9.81 * summary.time, 1e-3, || "falling velocity".to_string());
    }

    #[test]
    fn particle_collapse_stops_gracefully() {
        let mut params = boxed_params();
        params.time_max = 1.;
        let mut p = particle(0, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.03));
        p.velrhop = V4::new(0., 0., -2., 1000.);
        let (mut sim, recorded) = simulation(&params, vec![p]);

        let summary = sim.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::ParticlesOutLimit);
        assert_eq!(summary.np_final, 0);
        assert_eq!(summary.excluded.pos, 1);
        assert!(summary.time < 0.1);
        let recorded = recorded.borrow();
        assert_eq!(recorded.parts.last().unwrap().2, 0);
    }

    #[test]
    fn step_limit_saves_the_last_step() {
        let mut params = boxed_params();
        params.nsteps_break = Some(3);
        params.time_out = 10.;
        let (mut sim, recorded) = simulation(&params, vec![particle(0, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5))]);
        let summary = sim.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::StepLimit);
        assert_eq!(summary.nstep, 3);
        assert_eq!(recorded.borrow().parts.len(), 2);
    }

    #[test]
    fn fatal_errors_finish_the_sink_first() {
        let params = boxed_params();
        let mut wall = particle(0, ParticleKind::Moving, vec3d(0.95, 0.5, 0.5));
        wall.code = Code::new(ParticleKind::Moving, 2);
        let (mut sim, recorded) = simulation(
            &params,
            vec![wall, particle(1, ParticleKind::Fluid, vec3d(0.5, 0.5, 0.5))],
        );
        sim.collab.motions.push(Box::new(MovingBoundary {
            mkbound: 2,
            velocity: [200., 0., 0.],
            start: 0.,
            end: None,
        }));

        let err = sim.run().unwrap_err();
        assert!(err.is_boundary_out());
        assert!(matches!(err, SimulationError::BoundaryParticlesOut { .. }));
        let recorded = recorded.borrow();
        match &recorded.summary.as_ref().unwrap().stop_reason {
            StopReason::Failed(msg) => assert!(!msg.is_empty()),
            other => panic!("unexpected stop reason {:?}", other),
        }
    }
}
