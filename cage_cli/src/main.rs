use std::fs;

use cage_core::{
    cancel::CancelToken,
    config::EngineConfig,
    error::{Error, Result},
    exercise::Exercise,
    ExecutionLimits, Executor, Submission,
};
use clap::{Args, Parser, Subcommand};
use log::debug;
use serde::Serialize;

#[derive(Parser)]
#[command(
    version = "0.1.0",
    name = "Iron Cage",
    author = "Kanari",
    about = "Runs untrusted scripts under limits and judges them."
)]
struct Opts {
    /// engine config file, defaults to $CAGE_CONFIG
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Run a script and print what happened
    Run(RunConfig),
    /// Judge a script against an exercise file
    Prefab(PrefabConfig),
    /// Only run the static pre-check
    Check(CheckConfig),
}

#[derive(Args, Debug)]
struct RunConfig {
    /// path of source
    src_path: String,
    /// file fed to the script as STDIN
    #[arg(long)]
    stdin: Option<String>,
    /// time limit(ms)
    #[arg(short, long)]
    time_limit: Option<u64>,
    /// memory limit(bytes)
    #[arg(short, long)]
    memory_limit: Option<u64>,
}

#[derive(Args, Debug)]
struct PrefabConfig {
    /// exercise file
    exercise: String,
    /// path of source
    src_path: String,
}

#[derive(Args, Debug)]
struct CheckConfig {
    /// path of source
    src_path: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    let config = EngineConfig::load(opts.config.as_deref())?;
    debug!("engine config: {:?}", config);

    match opts.subcmd {
        SubCommand::Run(run) => {
            let mut submission = Submission::new(read_source(&run.src_path)?);
            if let Some(path) = &run.stdin {
                submission = submission.with_stdin(fs::read_to_string(path)?);
            }
            let limits = ExecutionLimits {
                timeout_ms: run.time_limit.unwrap_or(config.limits.timeout_ms),
                memory_bytes: run.memory_limit.unwrap_or(config.limits.memory_bytes),
                ..config.limits.clone()
            };
            let executor = Executor::new(config)?;
            let result = executor.execute_with(&submission, Some(limits), &CancelToken::new());
            print_json(&result)?;
        }
        SubCommand::Prefab(prefab) => {
            let exercise = Exercise::from_file(&prefab.exercise)?;
            let submission = exercise.submission(read_source(&prefab.src_path)?);
            let executor = Executor::new(config)?;
            let result =
                executor.execute_with(&submission, exercise.limits.clone(), &CancelToken::new());
            print_json(&result)?;
        }
        SubCommand::Check(check) => {
            let outcome = config.precheck()?.check(&read_source(&check.src_path)?);
            print_json(&outcome)?;
        }
    }

    Ok(())
}

fn read_source(path: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        _ => Error::from(e),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
