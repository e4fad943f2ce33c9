use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use std::path::Path;

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the loaded configuration
    Show {
        #[arg(short, long, value_enum, default_value = "toml")]
        format: Format,
    },

    /// Print one value, e.g. `sandbox.max_timeout`
    Get { key: String },

    /// Parse and validate a config file without using it
    Check {
        /// File to check (defaults to the active config)
        file: Option<std::path::PathBuf>,
    },

    /// Print the config file path
    Path,

    /// Write the commented default config
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => {
            let config = Config::load()?;
            let rendered = match format {
                Format::Json => serde_json::to_string_pretty(&config)?,
                Format::Toml => toml::to_string_pretty(&config)?,
            };
            println!("{rendered}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            println!("{}", Config::load()?.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Check { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::config_path()?,
            };
            check(&path)
        }
        ConfigCommands::Path => {
            println!("{}", Config::config_path()?.display());
            Ok(())
        }
        ConfigCommands::Init { force } => init(&Config::config_path()?, force),
    }
}

fn check(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config =
        Config::from_toml(&content).with_context(|| format!("{} is invalid", path.display()))?;

    let limits = config.resource_limits();
    println!("{}: ok", path.display());
    println!(
        "  requests:  {} default, {} max, {} worker(s)",
        config.sandbox.default_timeout, config.sandbox.max_timeout, config.engine.workers
    );
    println!(
        "  instance:  {} as {}, {} MiB, {} cpu, {} procs",
        config.sandbox.image, config.sandbox.user, config.sandbox.memory_mb, limits.cpus,
        limits.max_processes
    );
    println!(
        "  runtime:   >= {}, at most {} live",
        config.runtime.version_floor, config.runtime.max_live_instances
    );
    println!(
        "  reaper:    {} after {}",
        if config.reaper.enabled { "removes" } else { "disabled, would remove" },
        config.reaper.max_instance_age
    );
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
