mod command;
mod config;
mod control_lock;
mod descriptor;
mod pidfile;
mod process;
mod status;
mod supervisor;

use clap::error::ErrorKind;
use clap::Parser;
use command::Command;
use descriptor::ServiceDescriptor;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

/// Start, stop, restart and health-check one background worker process,
/// tracking it with a PID file and a lock file.
#[derive(Parser, Debug)]
#[command(name = "workerctl", version, about)]
pub struct Cli {
    /// Command to run
    #[arg(value_enum)]
    command: Command,

    /// Config file path
    #[arg(short, long, default_value = "workerctl.toml")]
    config: PathBuf,

    /// Print status as JSON
    #[arg(long)]
    json: bool,

    /// Extra logging (signals, liveness checks, lock waits)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(_) => {
            println!("{}", command::usage("workerctl"));
            return ExitCode::from(command::EXIT_USAGE);
        }
    };

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let desc = match config::load_config(&cli.config)
        .and_then(|config| ServiceDescriptor::from_config(&config))
    {
        Ok(desc) => desc,
        Err(e) => {
            eprintln!("workerctl: {e}");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Supervisor::new(desc);
    let outcome = command::dispatch(&supervisor, cli.command, cli.json).await;
    println!("{}", outcome.message);
    ExitCode::from(outcome.code)
}
