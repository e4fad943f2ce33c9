use anyhow::Result;
use clap::Args;
use std::sync::Arc;

use crate::config::Config;
use crate::reaper::ReaperRunner;
use crate::sandbox::DockerRuntime;

#[derive(Args)]
pub struct ReapArgs {
    /// Run a single sweep and exit
    #[arg(long)]
    pub once: bool,
}

pub async fn run(args: ReapArgs) -> Result<()> {
    let config = Config::load()?;
    let runtime = DockerRuntime::connect(
        config.runtime.endpoint.as_deref(),
        config.runtime.connect_timeout_secs,
    )?;
    let runner = ReaperRunner::from_config(&config, Arc::new(runtime))?;

    if !args.once {
        if !config.reaper.enabled {
            anyhow::bail!("Reaper is disabled in config (reaper.enabled = false)");
        }
        return runner.run().await;
    }

    match runner.run_once().await? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("Another reaper is sweeping; skipped"),
    }
    Ok(())
}
