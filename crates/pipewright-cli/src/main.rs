//! Pipewright CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing::warn;

mod commands;
mod config;
mod handlers;
mod progress;
mod telemetry;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Log filter, e.g. `debug` or `pipewright_scheduler=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let (config, config_error) = CliConfig::load_or_default();

    telemetry::init(
        cli.log_level.as_deref().unwrap_or(&config.log_level),
        cli.log_format.unwrap_or(config.log_format),
    );
    if let Some(e) = config_error {
        warn!(error = %format!("{e:#}"), "Ignoring unreadable configuration, using defaults");
    }

    match cli.command {
        Commands::Init { path, force } => handlers::init(&path, force)?,
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { trigger } => handlers::plan(&trigger)?,
        Commands::Run {
            trigger,
            max_parallel,
            fail_fast,
            workspace,
            artifacts_dir,
            retention_days,
            verbose,
            report,
        } => {
            let options = handlers::RunOptions {
                trigger,
                max_parallel,
                fail_fast,
                workspace,
                artifacts_dir,
                retention_days,
                verbose,
                report,
            };
            if !handlers::run(&config, options).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
