use anyhow::Result;
use clap::{Args, Subcommand};

use crate::cleanup::{CleanupLog, CleanupOutcome};
use crate::paths::Paths;

#[derive(Args)]
pub struct CleanupLogArgs {
    #[command(subcommand)]
    pub command: CleanupLogCommands,
}

#[derive(Subcommand)]
pub enum CleanupLogCommands {
    /// Print recent records
    Show {
        /// Number of records from the end
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Only failed removals
        #[arg(long)]
        failed: bool,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check the hash chain
    Verify,
}

pub async fn run(args: CleanupLogArgs) -> Result<()> {
    let log = CleanupLog::new(Paths::resolve()?.cleanup_log());
    match args.command {
        CleanupLogCommands::Show {
            limit,
            failed,
            json,
        } => show(&log, limit, failed, json),
        CleanupLogCommands::Verify => verify(&log),
    }
}

fn show(log: &CleanupLog, limit: usize, failed: bool, json: bool) -> Result<()> {
    let entries: Vec<_> = log
        .read_all()?
        .into_iter()
        .filter(|e| !failed || e.record.outcome == CleanupOutcome::Failed)
        .collect();
    let start = entries.len().saturating_sub(limit);

    for entry in &entries[start..] {
        if json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        let record = &entry.record;
        let outcome = serde_json::to_value(record.outcome)?;
        let source = serde_json::to_value(record.source)?;
        print!(
            "{}  {:<12} {:<7} {}",
            record.ts.format("%Y-%m-%d %H:%M:%S"),
            outcome.as_str().unwrap_or_default(),
            source.as_str().unwrap_or_default(),
            record.handle.instance
        );
        match &record.detail {
            Some(detail) => println!("  ({})", detail),
            None => println!(),
        }
    }

    if entries.is_empty() {
        println!("No cleanup records at {}", log.path().display());
    }
    Ok(())
}

fn verify(log: &CleanupLog) -> Result<()> {
    let broken = log.verify_chain()?;
    if broken.is_empty() {
        println!("Cleanup log chain intact ({})", log.path().display());
        return Ok(());
    }
    for index in &broken {
        println!("Broken link at entry {}", index);
    }
    anyhow::bail!("{} broken link(s) in {}", broken.len(), log.path().display())
}
