use std::{
    fs::{create_dir_all, File},
    io::{BufWriter, Write},
    path::PathBuf,
};

use serde::Serialize;
use tracing::debug;

use crate::{
    cell_division::CellPartition,
    error::{Result, SimulationError},
    floating::FloatingSummary,
    floating_type_mod::FT,
    particle_code::{Code, ExcludedParticle, ParticleKind},
    parts_out::OutCounts,
    timestep::DtRange,
    vel_of, V3, V4, VD3,
};

/// Read-only access to the live particles after a committed step.
#[derive(Clone, Copy)]
pub struct ParticleView<'a> {
    pub np: usize,
    pub npb: usize,
    pub idp: &'a [u32],
    pub code: &'a [Code],
    pub pos: &'a [VD3],
    pub velrhop: &'a [V4],
    pub partition: Option<&'a CellPartition>,
}

impl<'a> ParticleView<'a> {
    /// Indices of live particles that are not halo copies.
    pub fn real_particles(&self) -> impl Iterator<Item = usize> + 'a {
        let code = self.code;
        (0..self.np).filter(move |&i| !code[i].is_periodic())
    }
}

/// Measurement probes. Sampled once per step before the next partition.
pub trait GaugeSink {
    fn sample(&mut self, time: f64, nstep: u64, view: &ParticleView) -> Result<()>;
}

/// One output cycle.
pub struct PartData<'a> {
    pub part: u32,
    pub time: f64,
    pub nstep: u64,
    pub view: ParticleView<'a>,
    pub dt_range: Option<DtRange>,
    pub excluded: Vec<ExcludedParticle>,
    pub excluded_counts: OutCounts,
    pub floating: Vec<FloatingSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    TimeMax,
    /// Live particle count fell below the configured minimum.
    ParticlesOutLimit,
    StepLimit,
    Failed(String),
}

/// End-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub nstep: u64,
    pub time: f64,
    pub parts: u32,
    pub np_final: usize,
    pub np_max: usize,
    pub max_capacity: usize,
    pub resize_count: usize,
    pub dt_range: Option<DtRange>,
    pub dt_modif: u32,
    pub excluded: OutCounts,
    pub statistics: Option<String>,
}

/// Receives output cycles and the final report.
pub trait PartSink {
    fn save_part(&mut self, part: &PartData) -> Result<()>;
    fn finish(&mut self, summary: &RunSummary) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PartSink for NullSink {
    fn save_part(&mut self, _part: &PartData) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ParticleRecord {
    id: u32,
    kind: ParticleKind,
    pos: VD3,
    vel: V3,
    rhop: FT,
}

#[derive(Serialize)]
struct PartRecord<'a> {
    part: u32,
    time: f64,
    nstep: u64,
    np: usize,
    npb: usize,
    dt_range: Option<DtRange>,
    excluded_counts: OutCounts,
    excluded: &'a [ExcludedParticle],
    floating: &'a [FloatingSummary],
    #[serde(skip_serializing_if = "Option::is_none")]
    particles: Option<Vec<ParticleRecord>>,
}

/// Writes every part to `<folder>/<basename>_<part>.yaml`, an index of parts
/// to `<basename>.series.yaml` and the final report to `<basename>_summary.yaml`.
pub struct YamlPartSink {
    folder: PathBuf,
    basename: String,
    write_particles: bool,
    series_file: BufWriter<File>,
    parts_written: usize,
}

impl YamlPartSink {
    pub fn new(folder: impl Into<PathBuf>, basename: impl Into<String>, write_particles: bool) -> Result<YamlPartSink> {
        let folder: PathBuf = folder.into();
        let basename: String = basename.into();

        create_dir_all(&folder).map_err(|e| SimulationError::io(&folder, e))?;
        let series_path = folder.join(format!("{}.series.yaml", basename));
        let mut series_file = BufWriter::new(File::create(&series_path).map_err(|e| SimulationError::io(&series_path, e))?);
        writeln!(series_file, "parts:").map_err(|e| SimulationError::io(&series_path, e))?;

        Ok(YamlPartSink {
            folder,
            basename,
            write_particles,
            series_file,
            parts_written: 0,
        })
    }

    pub fn parts_written(&self) -> usize {
        self.parts_written
    }

    fn write_yaml<T: Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        let path = self.folder.join(filename);
        let file = File::create(&path).map_err(|e| SimulationError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_yaml::to_writer(&mut writer, value)?;
        writer.flush().map_err(|e| SimulationError::io(&path, e))
    }
}

impl PartSink for YamlPartSink {
    fn save_part(&mut self, part: &PartData) -> Result<()> {
        let view = &part.view;
        let particles = self.write_particles.then(|| {
            view.real_particles()
                .map(|i| ParticleRecord {
                    id: view.idp[i],
                    kind: view.code[i].kind(),
                    pos: view.pos[i],
                    vel: vel_of(&view.velrhop[i]),
                    rhop: view.velrhop[i].w,
                })
                .collect()
        });
        let record = PartRecord {
            part: part.part,
            time: part.time,
            nstep: part.nstep,
            np: view.np,
            npb: view.npb,
            dt_range: part.dt_range,
            excluded_counts: part.excluded_counts,
            excluded: &part.excluded,
            floating: &part.floating,
            particles,
        };

        let filename = format!("{}_{:04}.yaml", self.basename, part.part);
        self.write_yaml(&filename, &record)?;

        let series_path = self.folder.join(format!("{}.series.yaml", self.basename));
        writeln!(self.series_file, "  - {{ name: \"{}\", time: {} }}", filename, part.time)
            .map_err(|e| SimulationError::io(&series_path, e))?;
        self.parts_written += 1;
        debug!("part {} written to {}", part.part, filename);
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<()> {
        let series_path = self.folder.join(format!("{}.series.yaml", self.basename));
        self.series_file
            .flush()
            .map_err(|e| SimulationError::io(&series_path, e))?;
        self.write_yaml(&format!("{}_summary.yaml", self.basename), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sph-engine-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn summary() -> RunSummary {
        RunSummary {
            stop_reason: StopReason::TimeMax,
            nstep: 10,
            time: 1.,
            parts: 1,
            np_final: 1,
            np_max: 1,
            max_capacity: 4,
            resize_count: 0,
            dt_range: None,
            dt_modif: 0,
            excluded: OutCounts::default(),
            statistics: None,
        }
    }

    #[test]
    fn yaml_sink_writes_parts_series_and_summary() {
        let dir = temp_dir("yaml-sink");
        let mut sink = YamlPartSink::new(&dir, "case", true).unwrap();

        let code = [Code::new(ParticleKind::Fluid, 0)];
        let pos = [VD3::new(0.5, 0.5, 0.5)];
        let velrhop = [V4::new(1., 0., 0., 1000.)];
        let view = ParticleView {
            np: 1,
            npb: 0,
            idp: &[7],
            code: &code,
            pos: &pos,
            velrhop: &velrhop,
            partition: None,
        };
        let part = PartData {
            part: 0,
            time: 0.,
            nstep: 0,
            view,
            dt_range: None,
            excluded: vec![],
            excluded_counts: OutCounts::default(),
            floating: vec![],
        };
        sink.save_part(&part).unwrap();
        sink.finish(&summary()).unwrap();
        assert_eq!(sink.parts_written(), 1);

        let part_yaml: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(dir.join("case_0000.yaml")).unwrap()).unwrap();
        assert_eq!(part_yaml["np"].as_u64(), Some(1));
        assert_eq!(part_yaml["particles"][0]["id"].as_u64(), Some(7));

        let series = std::fs::read_to_string(dir.join("case.series.yaml")).unwrap();
        assert!(series.contains("case_0000.yaml"));

        let report = std::fs::read_to_string(dir.join("case_summary.yaml")).unwrap();
        assert!(report.contains("TimeMax"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
