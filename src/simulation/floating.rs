use nalgebra::{Matrix3, Rotation3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    domain::Domain,
    error::{BackendError, Result, SimulationError},
    floating_type_mod::FT,
    integrator::update_pos,
    particle_store::ParticleStore,
    simulation_parameters::Constants,
    to_f64_3, to_ft3, vel_of, velrhop, V3, VD3,
};

pub type M3 = Matrix3<f64>;

/// Marker in the floating index map for particles that are not in the store.
const NO_INDEX: usize = usize::MAX;

/// Locked axes of a floating body. `true` means the component is forced to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstraintMask {
    #[serde(default)]
    pub translation: [bool; 3],
    #[serde(default)]
    pub rotation: [bool; 3],
}

impl ConstraintMask {
    pub fn apply(&self, vel: &mut V3, omega: &mut V3) {
        for d in 0..3 {
            if self.translation[d] {
                vel[d] = 0.;
            }
            if self.rotation[d] {
                omega[d] = 0.;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityPoint {
    pub time: f64,
    #[serde(default)]
    pub x: Option<FT>,
    #[serde(default)]
    pub y: Option<FT>,
    #[serde(default)]
    pub z: Option<FT>,
}

impl VelocityPoint {
    fn components(&self) -> [Option<FT>; 3] {
        [self.x, self.y, self.z]
    }
}

/// Piecewise-linear velocity over time. A component missing at either end of
/// the active segment is not imposed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VelocitySeries {
    points: Vec<VelocityPoint>,
}

impl VelocitySeries {
    pub fn new(points: Vec<VelocityPoint>) -> Result<Self> {
        if points.windows(2).any(|w| !(w[0].time < w[1].time)) {
            return Err(SimulationError::InvalidConfig(
                "imposed velocity times must be strictly increasing".into(),
            ));
        }
        Ok(VelocitySeries { points })
    }

    pub fn value_at(&self, t: f64) -> [Option<FT>; 3] {
        let idx = self.points.partition_point(|p| p.time <= t);
        match (idx, self.points.len()) {
            (_, 0) => [None; 3],
            (0, _) => self.points[0].components(),
            (i, n) if i == n => self.points[n - 1].components(),
            (i, _) => {
                let a = &self.points[i - 1];
                let b = &self.points[i];
                let f = ((t - a.time) / (b.time - a.time)) as FT;
                let (ca, cb) = (a.components(), b.components());
                let mut out = [None; 3];
                for d in 0..3 {
                    if let (Some(va), Some(vb)) = (ca[d], cb[d]) {
                        out[d] = Some(va + (vb - va) * f);
                    }
                }
                out
            }
        }
    }
}

/// Rigid body made of floating particles with consecutive ids.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatingBody {
    pub mkbound: u16,
    pub id_begin: u32,
    pub count: u32,
    pub mass: f64,
    pub center: VD3,
    /// Rotation angles (rad) about x, y and z.
    pub angles: VD3,
    /// Inertia tensor in the reference orientation.
    pub inertia: M3,
    pub vel: V3,
    pub omega: V3,
    /// Force and torque summed over the last sub-step.
    pub force: V3,
    pub torque: V3,
    pub constraints: ConstraintMask,
    pub linear_velocity: Option<VelocitySeries>,
    pub angular_velocity: Option<VelocitySeries>,
    /// Motion is computed by the rigid-body backend.
    pub external: bool,
    /// Largest particle distance to the center, used to detect periodic wrap.
    pub radius: f64,
}

impl FloatingBody {
    /// Body with mass, center and inertia derived from equal-mass particles.
    pub fn from_particles(mkbound: u16, id_begin: u32, positions: &[VD3], particle_mass: f64) -> Result<FloatingBody> {
        if positions.is_empty() {
            return Err(SimulationError::InvalidConfig(format!(
                "floating body {} has no particles",
                mkbound
            )));
        }
        let count = positions.len();
        let mass = particle_mass * count as f64;
        let center = positions.iter().fold(VD3::zeros(), |acc, p| acc + p) / count as f64;
        let mut inertia = M3::zeros();
        for p in positions {
            let r = p - center;
            inertia += (M3::identity() * r.norm_squared() - r * r.transpose()) * particle_mass;
        }
        Ok(FloatingBody {
            mkbound,
            id_begin,
            count: count as u32,
            mass,
            center,
            angles: VD3::zeros(),
            inertia,
            vel: V3::zeros(),
            omega: V3::zeros(),
            force: V3::zeros(),
            torque: V3::zeros(),
            constraints: ConstraintMask::default(),
            linear_velocity: None,
            angular_velocity: None,
            external: false,
            radius: 0.,
        })
    }

    pub fn contains_id(&self, id: u32) -> bool {
        id >= self.id_begin && id - self.id_begin < self.count
    }

    fn particle_mass(&self) -> FT {
        (self.mass / self.count as f64) as FT
    }

    fn distance(&self, pos: &VD3, center: &VD3, domain: &Domain) -> V3 {
        let dist = pos - center;
        if domain.is_periodic() && dist.norm() > self.radius {
            to_ft3(&domain.periodic_distance(dist))
        } else {
            to_ft3(&dist)
        }
    }

    fn summary(&self) -> FloatingSummary {
        FloatingSummary {
            mkbound: self.mkbound,
            mass: self.mass,
            center: self.center,
            angles: self.angles,
            vel: self.vel,
            omega: self.omega,
            force: self.force,
            torque: self.torque,
        }
    }
}

/// Committed state of a floating body, as seen by output and external forcing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatingSummary {
    pub mkbound: u16,
    pub mass: f64,
    pub center: VD3,
    pub angles: VD3,
    pub vel: V3,
    pub omega: V3,
    pub force: V3,
    pub torque: V3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub center: VD3,
    pub vel: V3,
    pub omega: V3,
}

/// Rigid-body solver that advances bodies flagged `external`.
///
/// All bodies are exported before a single `advance` per sub-step. The
/// exported force and torque are the fluid reaction plus any external
/// forcing; gravity is not included and must be applied by the backend.
pub trait RigidBodyBackend {
    fn set_body_forcing(&mut self, mkbound: u16, force: V3, torque: V3) -> Result<(), BackendError>;
    fn set_body_imposed_velocity(
        &mut self,
        mkbound: u16,
        linear: [Option<FT>; 3],
        angular: [Option<FT>; 3],
    ) -> Result<(), BackendError>;
    fn advance(&mut self, nstep: u64, time: f64, dt: f64, predictor: bool) -> Result<(), BackendError>;
    fn body_state(&self, mkbound: u16) -> Result<BodyState, BackendError>;
}

/// Additional loads on floating bodies (moorings, force points).
pub trait ExternalForcing {
    /// Force and torque added before the particle forces are summed.
    fn body_forcing(&self, body: &FloatingSummary, time: f64) -> Option<(V3, V3)>;

    /// Called after every completed step with the committed body states.
    fn update(&mut self, time: f64, dt: f64, bodies: &[FloatingSummary]) -> Result<()>;
}

/// Taut-only linear spring between a fixed anchor and a point of a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpringMooring {
    pub mkbound: u16,
    pub anchor: [f64; 3],
    /// Attachment point relative to the body center, in the reference orientation.
    pub fairlead: [f64; 3],
    pub stiffness: f64,
    pub rest_length: f64,
    #[serde(skip)]
    load: Option<(V3, V3)>,
}

impl SpringMooring {
    pub fn new(mkbound: u16, anchor: [f64; 3], fairlead: [f64; 3], stiffness: f64, rest_length: f64) -> Self {
        SpringMooring {
            mkbound,
            anchor,
            fairlead,
            stiffness,
            rest_length,
            load: None,
        }
    }

    fn compute_load(&self, body: &FloatingSummary) -> (V3, V3) {
        let rot = Rotation3::from_euler_angles(body.angles.x, body.angles.y, body.angles.z);
        let arm = rot * VD3::from(self.fairlead);
        let span = VD3::from(self.anchor) - (body.center + arm);
        let length = span.norm();
        if length <= self.rest_length || length == 0. {
            return (V3::zeros(), V3::zeros());
        }
        let force = span * (self.stiffness * (length - self.rest_length) / length);
        (to_ft3(&force), to_ft3(&arm.cross(&force)))
    }
}

impl ExternalForcing for SpringMooring {
    fn body_forcing(&self, body: &FloatingSummary, _time: f64) -> Option<(V3, V3)> {
        if body.mkbound != self.mkbound {
            return None;
        }
        Some(self.load.unwrap_or_else(|| self.compute_load(body)))
    }

    fn update(&mut self, _time: f64, _dt: f64, bodies: &[FloatingSummary]) -> Result<()> {
        self.load = bodies
            .iter()
            .find(|b| b.mkbound == self.mkbound)
            .map(|b| self.compute_load(b));
        Ok(())
    }
}

/// One floating sub-step request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatingStep {
    pub time: f64,
    pub nstep: u64,
    pub dt: f64,
    /// Symplectic predictor: particles move but body state is not committed.
    pub predictor: bool,
}

struct MotionResult {
    center: VD3,
    vel: V3,
    omega: V3,
}

/// Aggregates particle forces into rigid-body motion and moves the floating
/// particles accordingly.
#[derive(Debug, Clone)]
pub struct FloatingCoupler {
    bodies: Vec<FloatingBody>,
    /// Store index of every floating particle, by `id - id_begin` plus the body offset.
    ridp: Vec<usize>,
    offsets: Vec<usize>,
    ft_pause: f64,
    gravity: VD3,
    simulate_2d: bool,
    summary: Option<Vec<FloatingSummary>>,
}

impl FloatingCoupler {
    pub fn new(mut bodies: Vec<FloatingBody>, store: &ParticleStore, constants: &Constants, ft_pause: f64) -> Result<Self> {
        bodies.sort_by_key(|b| b.id_begin);
        let mut offsets = Vec::with_capacity(bodies.len());
        let mut total = 0usize;
        for (k, body) in bodies.iter().enumerate() {
            if body.count == 0 || !(body.mass > 0.) {
                return Err(SimulationError::InvalidConfig(format!(
                    "floating body {} needs particles and a positive mass",
                    body.mkbound
                )));
            }
            if k > 0 && bodies[k - 1].id_begin + bodies[k - 1].count > body.id_begin {
                return Err(SimulationError::InvalidConfig(format!(
                    "floating body {} overlaps the id range of body {}",
                    body.mkbound,
                    bodies[k - 1].mkbound
                )));
            }
            if body.inertia.try_inverse().is_none() && !constants.simulate_2d {
                return Err(SimulationError::InvalidConfig(format!(
                    "floating body {} has a singular inertia tensor",
                    body.mkbound
                )));
            }
            offsets.push(total);
            total += body.count as usize;
        }

        let mut coupler = FloatingCoupler {
            bodies,
            ridp: vec![NO_INDEX; total],
            offsets,
            ft_pause,
            gravity: constants.gravity_f64(),
            simulate_2d: constants.simulate_2d,
            summary: None,
        };
        coupler.update_ridp(store);

        for (k, body) in coupler.bodies.iter_mut().enumerate() {
            let offset = coupler.offsets[k];
            let radius = coupler.ridp[offset..offset + body.count as usize]
                .iter()
                .filter(|&&p| p != NO_INDEX)
                .map(|&p| (store.arrays.pos[p] - body.center).norm())
                .fold(0., f64::max);
            body.radius = radius;
        }
        debug!("{} floating bodies with {} particles", coupler.bodies.len(), total);
        Ok(coupler)
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn bodies(&self) -> &[FloatingBody] {
        &self.bodies
    }

    pub fn body(&self, mkbound: u16) -> Option<&FloatingBody> {
        self.bodies.iter().find(|b| b.mkbound == mkbound)
    }

    /// Rebuilds the id-to-index map. Must follow every reordering of the store.
    pub fn update_ridp(&mut self, store: &ParticleStore) {
        if self.bodies.is_empty() {
            return;
        }
        self.ridp.iter_mut().for_each(|r| *r = NO_INDEX);
        for i in store.npb..store.np {
            let code = store.arrays.code[i];
            if !code.is_floating() || code.is_periodic() {
                continue;
            }
            let id = store.arrays.idp[i];
            let k = self.bodies.partition_point(|b| b.id_begin <= id);
            if k == 0 || !self.bodies[k - 1].contains_id(id) {
                continue;
            }
            let body = &self.bodies[k - 1];
            self.ridp[self.offsets[k - 1] + (id - body.id_begin) as usize] = i;
        }
    }

    /// Store index of floating particle `id`, if it is alive.
    pub fn index_of(&self, id: u32) -> Option<usize> {
        let k = self.bodies.partition_point(|b| b.id_begin <= id);
        if k == 0 || !self.bodies[k - 1].contains_id(id) {
            return None;
        }
        let p = self.ridp[self.offsets[k - 1] + (id - self.bodies[k - 1].id_begin) as usize];
        (p != NO_INDEX).then(|| p)
    }

    /// Committed body states. Recomputed lazily after each commit.
    pub fn summary(&mut self) -> &[FloatingSummary] {
        let bodies = &self.bodies;
        self.summary
            .get_or_insert_with(|| bodies.iter().map(FloatingBody::summary).collect())
    }

    pub fn run(
        &mut self,
        step: FloatingStep,
        store: &mut ParticleStore,
        domain: &Domain,
        constants: &Constants,
        rigid: &mut Option<Box<dyn RigidBodyBackend>>,
        forcing: &mut [Box<dyn ExternalForcing>],
    ) -> Result<()> {
        if self.bodies.is_empty() || step.time < self.ft_pause {
            return Ok(());
        }
        let dt = step.dt;
        let dt_ft = dt as FT;

        let extra: Vec<(V3, V3)> = self
            .bodies
            .iter()
            .map(|body| {
                let summary = body.summary();
                forcing
                    .iter()
                    .filter_map(|f| f.body_forcing(&summary, step.time))
                    .fold((V3::zeros(), V3::zeros()), |(fa, ta), (f, t)| (fa + f, ta + t))
            })
            .collect();

        let ace = store
            .arrays
            .ace
            .as_ref()
            .ok_or(SimulationError::MissingBuffer("ace"))?;
        let pos = &store.arrays.pos;

        let mut results = Vec::with_capacity(self.bodies.len());
        for (k, body) in self.bodies.iter_mut().enumerate() {
            let (mut force, mut torque) = extra[k];
            let massp = body.particle_mass();
            let offset = self.offsets[k];
            for &p in &self.ridp[offset..offset + body.count as usize] {
                if p == NO_INDEX {
                    continue;
                }
                let a = ace[p];
                let dist = body.distance(&pos[p], &body.center, domain);
                force += a * massp;
                torque += dist.cross(&a) * massp;
            }
            body.force = force;
            body.torque = torque;

            let rot = Rotation3::from_euler_angles(body.angles.x, body.angles.y, body.angles.z).into_inner();
            let inertia = rot * body.inertia * rot.transpose();
            let ang_acc = if self.simulate_2d {
                // rotation about y only
                let iyy = inertia[(1, 1)];
                if iyy > 0. {
                    V3::new(0., (torque.y as f64 / iyy) as FT, 0.)
                } else {
                    V3::zeros()
                }
            } else {
                let inverse = inertia.try_inverse().ok_or_else(|| {
                    SimulationError::InvalidConfig(format!("floating body {} has a singular inertia tensor", body.mkbound))
                })?;
                to_ft3(&(inverse * to_f64_3(&torque)))
            };
            let lin_acc = to_ft3(&((to_f64_3(&force) + self.gravity * body.mass) / body.mass));

            let center = body.center + to_f64_3(&body.vel) * dt;
            let mut vel = body.vel + lin_acc * dt_ft;
            let mut omega = body.omega + ang_acc * dt_ft;
            if self.simulate_2d {
                vel.y = 0.;
                omega.x = 0.;
                omega.z = 0.;
            }
            if let Some(series) = &body.linear_velocity {
                for (d, v) in series.value_at(step.time).iter().enumerate() {
                    if let Some(v) = v {
                        vel[d] = *v;
                    }
                }
            }
            if let Some(series) = &body.angular_velocity {
                for (d, v) in series.value_at(step.time).iter().enumerate() {
                    if let Some(v) = v {
                        omega[d] = *v;
                    }
                }
            }
            body.constraints.apply(&mut vel, &mut omega);
            results.push(MotionResult { center, vel, omega });
        }

        if self.bodies.iter().any(|b| b.external) {
            let backend = rigid.as_mut().ok_or_else(|| {
                SimulationError::InvalidConfig("floating bodies are external but no rigid-body backend is attached".into())
            })?;
            for body in self.bodies.iter().filter(|b| b.external) {
                backend.set_body_forcing(body.mkbound, body.force, body.torque)?;
                let linear = body.linear_velocity.as_ref().map_or([None; 3], |s| s.value_at(step.time));
                let angular = body.angular_velocity.as_ref().map_or([None; 3], |s| s.value_at(step.time));
                backend.set_body_imposed_velocity(body.mkbound, linear, angular)?;
            }
            backend.advance(step.nstep, step.time, dt, step.predictor)?;
            for (body, result) in self.bodies.iter().zip(results.iter_mut()) {
                if !body.external {
                    continue;
                }
                let state = backend.body_state(body.mkbound)?;
                result.center = state.center;
                result.vel = state.vel;
                result.omega = state.omega;
                if self.simulate_2d {
                    result.vel.y = 0.;
                    result.omega.x = 0.;
                    result.omega.z = 0.;
                }
                body.constraints.apply(&mut result.vel, &mut result.omega);
            }
        }

        let arrays = &mut store.arrays;
        for (k, body) in self.bodies.iter().enumerate() {
            let result = &results[k];
            let offset = self.offsets[k];
            for &p in &self.ridp[offset..offset + body.count as usize] {
                if p == NO_INDEX {
                    continue;
                }
                let dx = to_f64_3(&vel_of(&arrays.velrhop[p])) * dt;
                update_pos(
                    &mut arrays.pos[p],
                    &mut arrays.code[p],
                    dx,
                    false,
                    domain,
                    constants.mov_limit,
                );
                let dist = body.distance(&arrays.pos[p], &result.center, domain);
                let mut vel = result.vel + result.omega.cross(&dist);
                if self.simulate_2d {
                    vel.y = 0.;
                }
                arrays.velrhop[p] = velrhop(vel, arrays.velrhop[p].w);
            }
        }

        if step.predictor {
            trace!("floating predictor sub-step dt={}", dt);
            return Ok(());
        }

        for (body, result) in self.bodies.iter_mut().zip(results) {
            body.center = result.center;
            body.angles += to_f64_3(&result.omega) * dt;
            body.vel = result.vel;
            body.omega = result.omega;
        }
        self.summary = None;

        if !forcing.is_empty() {
            let summary = self.summary().to_vec();
            for f in forcing.iter_mut() {
                f.update(step.time, dt, &summary)?;
            }
        }
        Ok(())
    }
}
