use tracing::warn;

use crate::{
    error::{Result, SimulationError},
    particle_code::{ExcludedParticle, Special},
};

/// Next warning threshold in percent: 1, 2, 5, 10, 20, 30, ...
fn next_threshold(pct: u32) -> u32 {
    match pct {
        0 | 1 => 2,
        2..=4 => 5,
        5..=9 => 10,
        _ => pct + 10,
    }
}

/// Excluded counts by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutCounts {
    pub pos: usize,
    pub mov: usize,
    pub rhop: usize,
}

impl OutCounts {
    pub fn total(&self) -> usize {
        self.pos + self.mov + self.rhop
    }

    fn add(&mut self, reason: Special) {
        match reason {
            Special::OutMove => self.mov += 1,
            Special::OutRhop => self.rhop += 1,
            _ => self.pos += 1,
        }
    }
}

/// Bookkeeping of fluid particles removed from the run.
#[derive(Debug, Clone)]
pub struct PartsOut {
    fluid_initial: usize,
    parts_out_max: f32,
    wrn_part: u32,
    wrn_total: u32,
    part: Vec<ExcludedParticle>,
    part_counts: OutCounts,
    total_counts: OutCounts,
}

impl PartsOut {
    pub fn new(fluid_initial: usize, parts_out_max: f32, wrn_part: u32, wrn_total: u32) -> Self {
        PartsOut {
            fluid_initial,
            parts_out_max,
            wrn_part: wrn_part.max(1),
            wrn_total: wrn_total.max(1),
            part: Vec::new(),
            part_counts: OutCounts::default(),
            total_counts: OutCounts::default(),
        }
    }

    pub fn total(&self) -> OutCounts {
        self.total_counts
    }

    pub fn part_counts(&self) -> OutCounts {
        self.part_counts
    }

    /// Records particles removed by the last division. Fails once the total
    /// loss exceeds `parts_out_max` of the initial fluid.
    pub fn record(&mut self, excluded: &[ExcludedParticle], nstep: u64, time: f64) -> Result<()> {
        if excluded.is_empty() {
            return Ok(());
        }
        for p in excluded {
            self.part_counts.add(p.reason);
            self.total_counts.add(p.reason);
        }
        self.part.extend_from_slice(excluded);

        let initial = self.fluid_initial.max(1);
        let part = self.part_counts.total();
        if part * 100 >= self.wrn_part as usize * initial {
            warn!(
                "{}% of fluid particles excluded in the current part ({} at step {}, t={:.6})",
                self.wrn_part, part, nstep, time
            );
            self.wrn_part = next_threshold(self.wrn_part);
        }
        let total = self.total_counts.total();
        if total * 100 >= self.wrn_total as usize * initial {
            warn!(
                "{}% of fluid particles excluded so far ({} at step {}, t={:.6})",
                self.wrn_total, total, nstep, time
            );
            self.wrn_total = next_threshold(self.wrn_total);
        }

        if total as f64 / initial as f64 > self.parts_out_max as f64 {
            return Err(SimulationError::ExcessiveParticlesOut {
                excluded: total,
                fluid_total: self.fluid_initial,
                max_ratio: self.parts_out_max,
            });
        }
        Ok(())
    }

    /// Particles excluded since the previous output part.
    pub fn take_part(&mut self) -> (Vec<ExcludedParticle>, OutCounts) {
        let counts = std::mem::take(&mut self.part_counts);
        (std::mem::take(&mut self.part), counts)
    }
}
