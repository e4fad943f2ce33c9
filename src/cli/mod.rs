pub mod cleanup_log;
pub mod config;
pub mod paths;
pub mod reap;
pub mod run;
pub mod status;
pub mod validate;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "signal-sandbox")]
#[command(
    author,
    version,
    about = "Run generated numerical scripts under mandatory isolation"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SIGNAL_SANDBOX_JSON_LOGS")]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and execute a script in an isolated instance
    Run(run::RunArgs),

    /// Statically validate a script without running it
    Validate(validate::ValidateArgs),

    /// Show runtime health, policy facts and configuration
    Status,

    /// Remove orphaned instances
    Reap(reap::ReapArgs),

    /// Inspect the cleanup log
    CleanupLog(cleanup_log::CleanupLogArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
