use anyhow::Result;
use clap::Parser;

use signal_sandbox::Config;
use signal_sandbox::cli::{self, Cli, Commands};
use signal_sandbox::paths::Paths;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        configured_log_level().unwrap_or_else(|| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run(args) => cli::run::run(args).await,
        Commands::Validate(args) => cli::validate::run(args).await,
        Commands::Status => cli::status::run().await,
        Commands::Reap(args) => cli::reap::run(args).await,
        Commands::CleanupLog(args) => cli::cleanup_log::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}

/// `[logging] level` from an existing config file. Never creates one.
fn configured_log_level() -> Option<String> {
    let path = Paths::resolve().ok()?.config_file();
    let content = std::fs::read_to_string(path).ok()?;
    Config::from_toml(&content).ok().map(|c| c.logging.level)
}
