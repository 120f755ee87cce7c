use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{arg, crate_authors, crate_name, crate_version, value_parser, ArgMatches, Command};
use log::{error, info, warn};
use log4rs::Handle;

use crate::cancel::CancelToken;
use crate::checkpoint::Checkpoint;
use crate::config::{load_toml, RlConfig};
use crate::error::Error;
use crate::experiment::{create_experiment_dir, write_experiment_markdown, ExperimentDetails};
use crate::feedback::{StateVector, STATE_DIM};
use crate::fuzzer::{Action, FuzzerBackend};
use crate::log::{config_campaign, config_default};
use crate::metrics::{write_json, Comparison};
use crate::orchestrator::{Campaign, CampaignReport, Mode, Orchestrator};

const COMPARISON_FILE: &str = "comparison.json";

fn create_app() -> Command {
    Command::new(crate_name!())
        .version(crate::MAYBE_GIT_REF.unwrap_or(crate_version!()))
        .author(crate_authors!())
        .about("Steers a coverage-guided fuzzer with a mutation strategy policy trained by PPO")
        .arg(arg!(<target> "The instrumented target binary").value_parser(value_parser!(PathBuf)))
        .arg(arg!(-m --mode [mode] "What to run")
            .value_parser(["baseline", "rl-enhanced", "comparison"])
            .default_value("rl-enhanced"))
        .arg(arg!(--duration [secs] "Duration of a campaign in seconds")
            .value_parser(value_parser!(u64).range(1..))
            .default_value("3600"))
        .arg(arg!(--"fuzzer-config" [file] "TOML file configuring the fuzzer")
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(--"rl-config" [file] "TOML file configuring the policy and its training")
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(-s --seed [n] "Seed of the policy initialisation and action sampling")
            .value_parser(value_parser!(u64)))
        .arg(arg!(--checkpoint [file] "Start the policy from a checkpoint")
            .value_parser(value_parser!(PathBuf)))
        .arg(arg!(--greedy "Always pick the most probable strategy and do not train"))
        .arg(arg!(-t --title [t] "Title of the experiment"))
        .arg(arg!(-d --description [d] "Description of the experiment"))
        .arg(arg!(--experiments [dir] "Directory the experiment directories are created in")
            .value_parser(value_parser!(PathBuf))
            .default_value("experiments"))
        .subcommand_negates_reqs(true)
        .args_conflicts_with_subcommands(true)
        .subcommands(vec![
            Command::new("evaluate")
                .about("Prints the strategy distribution of a checkpointed policy for one state")
                .arg(arg!(<checkpoint> "The checkpoint file").value_parser(value_parser!(PathBuf)))
                .arg(arg!(<state> "coverage_rate crash_count exec_speed queue_size unique_paths")
                    .num_args(STATE_DIM)
                    .allow_negative_numbers(true)
                    .value_parser(value_parser!(f64))),
        ])
}

/// Entry point of a fuzzer binary. `load_backend` reads the backend configuration from the
/// optional `--fuzzer-config` file.
pub fn main<B: FuzzerBackend>(load_backend: fn(Option<&Path>) -> Result<B, Error>) -> ExitCode {
    let handle = match config_default().and_then(|config| {
        log4rs::init_config(config).map_err(|err| Error::Config(err.to_string()))
    }) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to init logging: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let matches = create_app().get_matches();

    if let Some(matches) = matches.subcommand_matches("evaluate") {
        return match evaluate(matches) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::FAILURE
            }
        };
    }

    info!("Git Version: {}", crate::GIT_REF);

    match run(&matches, &handle, load_backend) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run<B: FuzzerBackend>(
    matches: &ArgMatches,
    handle: &Handle,
    load_backend: fn(Option<&Path>) -> Result<B, Error>,
) -> Result<(), Error> {
    let target: &PathBuf = matches
        .get_one("target")
        .ok_or_else(|| Error::Config("missing target".to_string()))?;
    let mode: &String = matches
        .get_one("mode")
        .ok_or_else(|| Error::Config("missing mode".to_string()))?;
    let duration = Duration::from_secs(*matches.get_one::<u64>("duration").unwrap_or(&3600));
    let experiments_root = matches
        .get_one::<PathBuf>("experiments")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("experiments"));
    let title = matches.get_one::<String>("title").map(String::as_str);
    let description = matches
        .get_one::<String>("description")
        .map(String::as_str)
        .unwrap_or("No description.");

    let backend = load_backend(matches.get_one::<PathBuf>("fuzzer-config").map(PathBuf::as_path))?;
    let mut config: RlConfig =
        load_toml(matches.get_one::<PathBuf>("rl-config").map(PathBuf::as_path))?;
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = Some(*seed);
    }
    config.validate()?;

    let modes = match mode.as_str() {
        "comparison" => vec![Mode::Baseline, Mode::RlEnhanced],
        other => vec![other.parse::<Mode>()?],
    };

    let cancel = CancelToken::with_signals()?;
    let launched_with: Vec<String> = env::args().collect();
    let mut reports: Vec<(CampaignReport, PathBuf)> = Vec::new();

    for mode in modes {
        if cancel.is_cancelled() {
            warn!("Skipping the {} campaign, cancelled", mode);
            break;
        }

        let directory = create_experiment_dir(&experiments_root, backend.name(), mode, title)?;
        write_experiment_markdown(
            &directory,
            title.unwrap_or("untitled"),
            description,
            &ExperimentDetails {
                backend: backend.name(),
                mode,
                target,
                duration,
                launched_with: &launched_with,
            },
        )?;
        handle.set_config(config_campaign(directory.join("rlpuffin.log"))?);
        info!("Experiment directory: {}", directory.display());

        let campaign = Campaign {
            backend: backend.clone(),
            target: target.clone(),
            mode,
            duration,
            directory: directory.clone(),
            config: config.clone(),
            resume_from: matches.get_one::<PathBuf>("checkpoint").cloned(),
            greedy: matches.get_flag("greedy"),
        };
        let report = Orchestrator::new(campaign, cancel.clone())?.run()?;
        reports.push((report, directory));
    }

    if let [(baseline, _), (enhanced, directory)] = reports.as_slice() {
        let comparison = Comparison::new(baseline.summary, enhanced.summary);
        let improvement = &comparison.improvement;
        info!(
            "RL-enhanced vs. baseline: coverage {:+.1}%, crashes {:+.1}%, speed {:+.1}%, \
             paths {:+.1}%",
            improvement.coverage_percent,
            improvement.crashes_percent,
            improvement.speed_percent,
            improvement.paths_percent
        );
        write_json(&directory.join(COMPARISON_FILE), &comparison)?;
    }

    Ok(())
}

fn evaluate(matches: &ArgMatches) -> Result<(), Error> {
    let path: &PathBuf = matches
        .get_one("checkpoint")
        .ok_or_else(|| Error::Config("missing checkpoint".to_string()))?;
    let values: Vec<f64> = matches
        .get_many::<f64>("state")
        .map(|values| values.copied().collect())
        .unwrap_or_default();
    let state: [f64; STATE_DIM] = values
        .try_into()
        .map_err(|_| Error::Config(format!("expected {} state values", STATE_DIM)))?;
    let state = StateVector::from_array(state);

    let checkpoint = Checkpoint::load(path)?;
    let policy = &checkpoint.policy;

    for (action, p) in Action::ALL.iter().zip(policy.distribution(&state)) {
        println!("{:<12}{:.4}", action.name(), p);
    }
    println!("greedy: {}", policy.greedy(&state));
    println!("value: {:.4}", policy.value(&state));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_cli_arguments() {
        create_app().debug_assert();

        let matches = create_app()
            .try_get_matches_from(["rlpuffin", "/bin/target", "--mode", "comparison", "--greedy"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("mode").unwrap(), "comparison");
        assert_eq!(*matches.get_one::<u64>("duration").unwrap(), 3600);
        assert!(matches.get_flag("greedy"));

        assert!(create_app()
            .try_get_matches_from(["rlpuffin", "/bin/target", "--mode", "random"])
            .is_err());
    }

    #[test_log::test]
    fn test_evaluate_arguments() {
        let matches = create_app()
            .try_get_matches_from([
                "rlpuffin", "evaluate", "ckpt.json", "0.5", "0.1", "-0.2", "1", "0",
            ])
            .unwrap();
        let evaluate = matches.subcommand_matches("evaluate").unwrap();
        let state: Vec<f64> = evaluate.get_many::<f64>("state").unwrap().copied().collect();
        assert_eq!(state, vec![0.5, 0.1, -0.2, 1.0, 0.0]);
    }
}
