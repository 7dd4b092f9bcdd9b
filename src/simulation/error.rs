use std::{collections::TryReserveError, path::PathBuf};

use thiserror::Error;

use crate::particle_code::ExcludedParticle;

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;

/// Failures reported by a rigid-body backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no body registered with mkbound {0}")]
    UnknownBody(u16),

    #[error("backend step failed: {0}")]
    StepFailed(String),
}

#[derive(Debug, Error)]
pub enum SimulationError {
    /// Fixed, moving or floating particles left the domain. The run cannot continue.
    #[error("{} boundary particle(s) excluded at step {nstep} (t={time:.6})", .dump.len())]
    BoundaryParticlesOut {
        nstep: u64,
        time: f64,
        dump: Vec<ExcludedParticle>,
    },

    #[error("rigid-body backend failed: {0}")]
    Backend(#[from] BackendError),

    #[error("{excluded} fluid particles excluded out of {fluid_total}, above the allowed {max_ratio}")]
    ExcessiveParticlesOut {
        excluded: usize,
        fluid_total: usize,
        max_ratio: f32,
    },

    #[error("{requested} particles requested but the capacity ceiling is {ceiling}")]
    CapacityExhausted { requested: usize, ceiling: usize },

    #[error("failed to allocate particle arrays for {capacity} particles")]
    Allocation {
        capacity: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("cannot resize to {requested} particles while {np} particles are alive")]
    ResizeBelowCount { requested: usize, np: usize },

    #[error("symplectic predictor buffers are only partially allocated")]
    InvalidSymplecticState,

    #[error("particle array `{0}` is not allocated")]
    MissingBuffer(&'static str),

    #[error("forces requested before the particles were divided into cells")]
    NoPartition,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SimulationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SimulationError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_boundary_out(&self) -> bool {
        matches!(self, SimulationError::BoundaryParticlesOut { .. })
    }
}
