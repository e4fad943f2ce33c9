use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::sweep::{OrphanReaper, SweepReport};
use crate::cleanup::CleanupLog;
use crate::concurrency::SweepLock;
use crate::config::Config;
use crate::sandbox::runtime::IsolationRuntime;

/// Runs the reaper on a fixed interval, one sweeper per state dir.
pub struct ReaperRunner {
    reaper: OrphanReaper,
    interval: Duration,
    lock: SweepLock,
}

impl ReaperRunner {
    pub fn new(reaper: OrphanReaper, interval: Duration, lock: SweepLock) -> Self {
        Self {
            reaper,
            interval,
            lock,
        }
    }

    pub fn from_config(config: &Config, runtime: Arc<dyn IsolationRuntime>) -> Result<Self> {
        config.paths.ensure_dirs()?;
        let reaper = OrphanReaper::new(
            runtime,
            CleanupLog::new(config.paths.cleanup_log()),
            config.engine.owner.clone(),
            config.max_instance_age()?,
            config.teardown_timeout()?,
        );
        Ok(Self::new(
            reaper,
            config.reaper_interval()?,
            SweepLock::new(config.paths.sweep_lock()),
        ))
    }

    /// One sweep if no other process is sweeping; `None` if skipped.
    pub async fn run_once(&self) -> Result<Option<SweepReport>> {
        let Some(_guard) = self.lock.try_acquire()? else {
            debug!("Another reaper holds the sweep lock, skipping");
            return Ok(None);
        };
        let report = self.reaper.sweep_once(Utc::now()).await?;
        if report.removed + report.already_gone + report.failed > 0 {
            info!(
                "Sweep: {} examined, {} removed, {} already gone, {} failed",
                report.examined, report.removed, report.already_gone, report.failed
            );
        } else {
            debug!("Sweep: {} examined, nothing expired", report.examined);
        }
        Ok(Some(report))
    }

    /// Sweep forever. Errors are logged and the loop continues.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting orphan reaper: interval {:?}, max age {:?}",
            self.interval,
            self.reaper.max_age()
        );

        loop {
            if let Err(e) = self.run_once().await {
                warn!("Reaper sweep failed: {:#}", e);
            }
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::MockIsolationRuntime;

    fn runner(tmp: &std::path::Path) -> ReaperRunner {
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_list_labeled().returning(|_, _| Ok(Vec::new()));
        let reaper = OrphanReaper::new(
            Arc::new(runtime),
            CleanupLog::in_state_dir(tmp),
            "owner",
            Duration::from_secs(300),
            Duration::from_secs(1),
        );
        ReaperRunner::new(reaper, Duration::from_secs(60), SweepLock::in_state_dir(tmp))
    }

    #[tokio::test]
    async fn skips_when_lock_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(tmp.path());

        let held = SweepLock::in_state_dir(tmp.path()).acquire().unwrap();
        assert!(runner.run_once().await.unwrap().is_none());

        drop(held);
        let report = runner.run_once().await.unwrap().unwrap();
        assert_eq!(report.examined, 0);
    }
}
