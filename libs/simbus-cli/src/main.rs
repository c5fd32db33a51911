//! `simbus` — run a co-simulation model from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use simbus::core::signals;
use simbus::input::ModelInput;
use simbus::storage::ResultsStorage;
use simbus::{Model, Task, TaskOutcome};

#[derive(Parser)]
#[command(name = "simbus")]
#[command(about = "Co-simulation master: run a declarative model file")]
#[command(version)]
struct Cli {
    /// Model file (YAML)
    model: PathBuf,

    /// Result directory; overrides the model's results.result_dir
    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// End time override in seconds
    #[arg(long)]
    end_time: Option<f64>,

    /// Log filter, e.g. "info" or "simbus=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn run(cli: &Cli) -> anyhow::Result<TaskOutcome> {
    let mut input =
        ModelInput::from_file(&cli.model).with_context(|| "reading model file failed")?;
    if let Some(end_time) = cli.end_time {
        input.task.end_time = Some(end_time);
    }

    let task = Task::read(&input.task).context("task settings invalid")?;
    let mut model = Model::build(&input, &task).context("building the model failed")?;

    let mut storage = ResultsStorage::default();
    if let Some(dir) = &cli.result_dir {
        storage.set_result_dir(dir);
    } else if let Some(dir) = &input.results.result_dir {
        storage.set_result_dir(dir);
    }
    apply_results_input(&mut storage, &input.results);

    signals::install_signal_handlers().context("installing signal handlers failed")?;

    task.run(&mut model, &mut storage)
        .context("simulation failed")
        .map_err(Into::into)
}

fn apply_results_input(storage: &mut ResultsStorage, results: &simbus::input::ResultsInput) {
    use simbus::storage::ChannelClass;

    if let Some(level) = results.store_level {
        storage.set_store_level(level.into());
    }
    if let Some(enabled) = results.store_inputs {
        storage.set_class_enabled(ChannelClass::In, enabled);
    }
    if let Some(enabled) = results.store_outputs {
        storage.set_class_enabled(ChannelClass::Out, enabled);
    }
    if let Some(enabled) = results.store_locals {
        storage.set_class_enabled(ChannelClass::Local, enabled);
    }
    if let Some(enabled) = results.store_rt_factors {
        storage.set_class_enabled(ChannelClass::RtFactor, enabled);
    }
    if let Some(backends) = &results.backends {
        for backend in backends {
            match backend.kind {
                simbus::input::BackendKind::Csv => {
                    storage.set_csv(true, backend.store_at_runtime);
                }
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone())),
        )
        .init();

    match run(&cli) {
        Ok(TaskOutcome::Completed) => ExitCode::SUCCESS,
        Ok(TaskOutcome::Interrupted) => ExitCode::from(130),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
