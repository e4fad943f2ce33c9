use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::config::Config;
use crate::validator::Validator;

#[derive(Args)]
pub struct ValidateArgs {
    /// Python script to check
    pub file: PathBuf,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ValidateArgs) -> Result<()> {
    let config = Config::load()?;
    let validator = Validator::new(config.validator_settings());

    let code = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let verdict = validator.validate(&code);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else if verdict.accepted {
        println!("{}: accepted", args.file.display());
    } else {
        for violation in &verdict.violations {
            println!("{}: {}", args.file.display(), violation);
        }
    }

    if !verdict.accepted {
        anyhow::bail!("{} violation(s)", verdict.violations.len());
    }
    Ok(())
}
