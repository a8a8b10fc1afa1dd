//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline
    Init {
        /// Where to write it
        #[arg(default_value = "pipewright.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a pipeline: parse, expand matrices, build the job graph
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "pipewright.yaml")]
        path: PathBuf,
    },

    /// Show the instances a trigger would run, grouped into parallel waves
    Plan {
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Run a pipeline locally
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        /// Upper bound on concurrently running instances
        #[arg(long)]
        max_parallel: Option<u32>,

        /// Cancel everything not yet started once any instance fails
        #[arg(long)]
        fail_fast: bool,

        /// Directory steps run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Persist artifacts under this directory instead of in memory
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Days sealed artifacts are kept before garbage collection
        #[arg(long)]
        retention_days: Option<u32>,

        /// Print step output lines as they arrive
        #[arg(short, long)]
        verbose: bool,

        /// Write the final run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the JSON schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// The pipeline file and the event that triggers it.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Path to pipeline file
    #[arg(default_value = "pipewright.yaml")]
    pub path: PathBuf,

    /// Event kind
    #[arg(short, long, value_enum, default_value_t = EventArg::Push)]
    pub event: EventArg,

    /// Pushed branch, or the head branch of a pull request
    #[arg(short = 'r', long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Base branch of a pull request
    #[arg(long, default_value = "main")]
    pub base_ref: String,

    /// Commit sha exposed to expressions
    #[arg(long)]
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    Push,
    PullRequest,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
