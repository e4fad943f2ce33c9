use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::engine::Engine;
use crate::sandbox::ExecutionResult;

#[derive(Args)]
pub struct RunArgs {
    /// Python script to execute
    pub file: PathBuf,

    /// JSON object file passed to the script as its parameters
    #[arg(short, long)]
    pub params: Option<PathBuf>,

    /// Timeout in seconds (default from config)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Runtime image (default from config)
    #[arg(long)]
    pub image: Option<String>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = Config::load()?;
    let engine = Engine::from_config(&config)?;

    let code = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let mut builder = engine.request(code);
    if let Some(path) = &args.params {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parameters: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a JSON object", path.display()))?;
        builder = builder.parameters(parameters);
    }
    if let Some(secs) = args.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(image) = args.image {
        builder = builder.image(image);
    }
    let request = builder.build()?;

    let result = engine.execute(&request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result {
        ExecutionResult::Success { .. } => Ok(()),
        other => anyhow::bail!("Execution finished with status {}", other.status()),
    }
}
