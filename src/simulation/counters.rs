use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

#[derive(Clone, Debug)]
struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}

impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }

    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }
}

impl Counter<f64> {
    fn avg(&self) -> f64 {
        if self.values.is_empty() {
            return 0.;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
    fn min(&self) -> f64 {
        self.values.iter().cloned().fold(f64::MAX, f64::min)
    }
    fn max(&self) -> f64 {
        self.values.iter().cloned().fold(f64::MIN, f64::max)
    }
}

impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.sum() / self.values.len() as u32
    }

    fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

/// Per-step samples of scalar quantities (particle count, dt, ...).
#[derive(Clone, Debug)]
pub struct ValueCounters {
    counters: HashMap<String, Counter<f64>>,
    enabled: bool,
}

impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn add_value(&mut self, id: &str, v: f64) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<f64>::new)
                .add_value(v);
        }
    }

    pub fn avg(&self, id: &str) -> Option<f64> {
        self.counters.get(id).map(|c| c.avg())
    }
}

/// Wall-clock timers around the phases of a step.
#[derive(Clone, Debug)]
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if let Some(counter) = self.counters.get_mut(id) {
            counter.end();
        }
    }

    pub fn total(&self, id: &str) -> Option<Duration> {
        self.counters.get(id).map(|c| c.sum())
    }

    pub fn num_samples(&self, id: &str) -> usize {
        self.counters.get(id).map_or(0, |c| c.values.len())
    }
}

pub fn write_statistics(pcounters: &PerformanceCounters, vcounters: &ValueCounters) -> String {
    let mut s = String::new();

    if let Some(total) = pcounters.total("simulation-step") {
        let _ = writeln!(s, "simulation-time: {}ms", total.as_secs_f64() * 1000.);
        let _ = writeln!(s);
    }

    let mut v = pcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        let _ = writeln!(
            s,
            "{}: avg:{}ms total:{}ms",
            label,
            pcounter.avg().as_secs_f64() * 1000.,
            pcounter.sum().as_secs_f64() * 1000.
        );
    }
    let _ = writeln!(s);

    let mut v = vcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        let _ = writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        );
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_counters_record_nothing() {
        let mut p = PerformanceCounters::new(false);
        p.begin("divide");
        p.end("divide");
        assert_eq!(p.num_samples("divide"), 0);

        let mut v = ValueCounters::new(false);
        v.add_value("np", 10.);
        assert!(v.avg("np").is_none());
    }

    #[test]
    fn statistics_list_every_counter() {
        let mut p = PerformanceCounters::new(true);
        for _ in 0..3 {
            p.begin("simulation-step");
            p.end("simulation-step");
        }
        assert_eq!(p.num_samples("simulation-step"), 3);

        let mut v = ValueCounters::new(true);
        v.add_value("np", 10.);
        v.add_value("np", 20.);
        assert_eq!(v.avg("np"), Some(15.));

        let report = write_statistics(&p, &v);
        assert!(report.contains("simulation-time"));
        assert!(report.contains("np: min:10 max:20 avg:15"));
    }
}
