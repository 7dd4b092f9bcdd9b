use std::path::Path;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    error::{Result, SimulationError},
    force_evaluator::WcsphEvaluator,
    scene::SceneConfig,
    sinks::YamlPartSink,
    simulation_parameters::SimulationParams,
    state::Collaborators,
    Simulation,
};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

pub fn start() {
    let matches = App::new("SPH Engine")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation paramaters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("MAX_STEPS")
                        .long("max-steps")
                        .short("n")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given number of steps"),
                )
                .arg(
                    Arg::with_name("OUTPUT_DIR")
                        .long("output-dir")
                        .short("o")
                        .default_value("./out")
                        .takes_value(true)
                        .help("Folder for part files and the run summary"),
                )
                .arg(
                    Arg::with_name("WRITE_PARTICLES")
                        .long("write-particles")
                        .takes_value(false)
                        .help("Include every particle in the part files"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(run_matches) = matches.subcommand_matches("run") {
        if let Err(e) = run(run_matches) {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn read_yaml(path: &str) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path).map_err(|e| SimulationError::io(path, e))?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Replaces top-level entries of `params` by the ones in `overwrite`.
fn overwrite_params(params: &mut serde_yaml::Value, overwrite: serde_yaml::Value) -> Result<()> {
    let target = params
        .as_mapping_mut()
        .ok_or_else(|| SimulationError::InvalidConfig("simulation config is not a mapping".into()))?;
    let overwrite = match overwrite {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(()),
        _ => {
            return Err(SimulationError::InvalidConfig(
                "overwrite config is not a mapping".into(),
            ))
        }
    };
    for (k, v) in overwrite {
        let slot = target.get_mut(&k).ok_or_else(|| {
            SimulationError::InvalidConfig(format!("not able to find attribute {:?}", k))
        })?;
        *slot = v;
    }
    Ok(())
}

fn run(run_matches: &ArgMatches) -> Result<()> {
    let parameter_file = run_matches.value_of("SIMULATION_CONFIG").unwrap_or_default();
    let mut params_value = read_yaml(parameter_file)?;
    if let Some(overwrite_file) = run_matches.value_of("OVERWRITE_CONFIG_FILE") {
        overwrite_params(&mut params_value, read_yaml(overwrite_file)?)?;
    }
    let mut params: SimulationParams = serde_yaml::from_value(params_value)?;
    if let Some(max_steps) = run_matches.value_of("MAX_STEPS") {
        let max_steps = max_steps
            .parse::<u64>()
            .map_err(|e| SimulationError::InvalidConfig(format!("--max-steps: {}", e)))?;
        params.nsteps_break = Some(max_steps);
    }
    params.validate()?;

    let scene_file = run_matches.value_of("SCENE_CONFIG").unwrap_or_default();
    let scene: SceneConfig = serde_yaml::from_value(read_yaml(scene_file)?)?;
    let setup = scene.build(&params)?;
    let constants = params.constants(setup.case.dp)?;

    let mut collab = Collaborators::new(Box::new(WcsphEvaluator::new(&constants)));
    collab.hooks = setup.hooks;
    collab.motions = setup.motions;
    collab.forcing = setup.forcing;

    let basename = Path::new(scene_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("case")
        .to_string();
    let output_dir = run_matches.value_of("OUTPUT_DIR").unwrap_or("./out");
    let sink = YamlPartSink::new(output_dir, basename, run_matches.is_present("WRITE_PARTICLES"))?;

    let counters_enabled = run_matches.is_present("STATISTICS_ENABLED");
    let mut simulation = Simulation::new(&params, setup.case, collab, Box::new(sink), counters_enabled)?;
    let summary = simulation.run()?;
    info!("stop reason: {:?}, {} steps", summary.stop_reason, summary.nstep);

    if let Some(statistics) = &summary.statistics {
        print!("{}", statistics);
        if let Some(statistics_path) = run_matches.value_of("STATISTICS_PATH") {
            std::fs::write(statistics_path, statistics).map_err(|e| SimulationError::io(statistics_path, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_replaces_known_keys_only() {
        let mut params: serde_yaml::Value = serde_yaml::from_str("time_max: 1.0\ncfl_number: 0.2\n").unwrap();
        overwrite_params(&mut params, serde_yaml::from_str("time_max: 2.5\n").unwrap()).unwrap();
        assert_eq!(params["time_max"].as_f64(), Some(2.5));
        assert_eq!(params["cfl_number"].as_f64(), Some(0.2));

        let err = overwrite_params(&mut params, serde_yaml::from_str("unknown: 1\n").unwrap());
        assert!(err.is_err());
    }
}
