use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod telemetry;

use config::{Config, ConfigError};
use reconciler::errors::StartupError;
use telemetry::TelemetryError;

#[derive(Parser)]
#[command(version, about = "Reconciles directory groups with Bitbucket permissions")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the reconciliation API
    Serve(ConfigArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Startup(#[from] StartupError),
}

fn serve(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;
    config.validate()?;

    // Sentry has to be set up before the runtime starts its threads.
    let _sentry = telemetry::init_logging(config.common.logging.as_ref());
    telemetry::init_metrics(config.common.metrics.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(reconciler::run(config.reconciler))?;
    Ok(())
}

fn check_config(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;
    config.validate()?;
    println!("{}: ok", args.config.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        CliCommand::Serve(args) => serve(args),
        CliCommand::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            eprintln!("permsync: {e}");
            ExitCode::FAILURE
        }
    }
}
