use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// From `time` on, parts are written every `tout` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeOutEntry {
    pub time: f64,
    pub tout: f64,
}

/// Piecewise output schedule.
#[derive(Debug, Clone)]
pub struct TimeOut {
    entries: Vec<TimeOutEntry>,
    base: usize,
    last_query: Option<(f64, f64)>,
}

impl TimeOut {
    pub fn constant(tout: f64) -> Result<TimeOut> {
        TimeOut::from_entries(&[TimeOutEntry { time: 0., tout }])
    }

    pub fn from_entries(entries: &[TimeOutEntry]) -> Result<TimeOut> {
        if entries.is_empty() {
            return Err(SimulationError::InvalidConfig("empty output schedule".into()));
        }
        for (i, e) in entries.iter().enumerate() {
            let ordered = i == 0 || entries[i - 1].time < e.time;
            if e.time < 0. || !(e.tout > 0.) || !ordered {
                return Err(SimulationError::InvalidConfig(format!(
                    "invalid output schedule entry (time:{} tout:{})",
                    e.time, e.tout
                )));
            }
        }
        Ok(TimeOut {
            entries: entries.to_vec(),
            base: 0,
            last_query: None,
        })
    }

    pub fn entries(&self) -> &[TimeOutEntry] {
        &self.entries
    }

    /// First output time strictly after `t` on the current interval grid,
    /// clamped to the start of the next interval.
    pub fn next_time(&mut self, t: f64) -> f64 {
        if let Some((last_t, last_next)) = self.last_query {
            if last_t == t {
                return last_next;
            }
        }

        let start_of = |entries: &[TimeOutEntry], idx: usize| entries.get(idx).map_or(f64::MAX, |e| e.time);
        let mut tnext = start_of(&self.entries, self.base + 1);
        while t >= tnext {
            self.base += 1;
            tnext = start_of(&self.entries, self.base + 1);
        }

        let tb = self.entries[self.base].time;
        let next = if t < tb {
            tb
        } else {
            let tout = self.entries[self.base].tout;
            let mut nt = ((t - tb) / tout) as u64;
            let mut next = tb + tout * nt as f64;
            while next <= t {
                nt += 1;
                next = tb + tout * nt as f64;
            }
            next.min(tnext)
        };

        self.last_query = Some((t, next));
        next
    }
}
