use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cleanup::{CleanupLog, CleanupOutcome, CleanupSource, HandleRef, remove_and_record};
use crate::sandbox::isolation::{OWNER_LABEL, REQUEST_ID_LABEL};
use crate::sandbox::runtime::{InstanceSummary, IsolationRuntime, RuntimeError};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub within_lifetime: usize,
    /// Instances with no known creation time; never removed.
    pub undated: usize,
    pub removed: usize,
    pub already_gone: usize,
    pub failed: usize,
}

/// Removes owner-labelled instances that outlived `max_age`.
pub struct OrphanReaper {
    runtime: Arc<dyn IsolationRuntime>,
    log: CleanupLog,
    owner: String,
    max_age: Duration,
    teardown_timeout: Duration,
}

impl OrphanReaper {
    pub fn new(
        runtime: Arc<dyn IsolationRuntime>,
        log: CleanupLog,
        owner: impl Into<String>,
        max_age: Duration,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            log,
            owner: owner.into(),
            max_age,
            teardown_timeout,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// One pass over the labelled instances, judged against `now`.
    ///
    /// Only a failure to list is an error; per-instance removal failures
    /// are recorded and counted, and the sweep continues.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, RuntimeError> {
        let instances = self.runtime.list_labeled(OWNER_LABEL, &self.owner).await?;
        let max_age = TimeDelta::from_std(self.max_age).unwrap_or(TimeDelta::MAX);

        let mut report = SweepReport {
            examined: instances.len(),
            ..SweepReport::default()
        };

        for instance in instances {
            let Some(created_at) = instance.created_at else {
                debug!("Skipping {}: no creation time", instance.name);
                report.undated += 1;
                continue;
            };
            if now.signed_duration_since(created_at) <= max_age {
                report.within_lifetime += 1;
                continue;
            }

            info!(
                "Reaping {} (created {})",
                instance.name,
                created_at.to_rfc3339()
            );
            let outcome = remove_and_record(
                self.runtime.as_ref(),
                &self.log,
                handle_ref(&instance, created_at),
                self.teardown_timeout,
                CleanupSource::Reaper,
            )
            .await;
            match outcome {
                CleanupOutcome::Removed => report.removed += 1,
                CleanupOutcome::AlreadyGone => report.already_gone += 1,
                CleanupOutcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }
}

fn handle_ref(instance: &InstanceSummary, created_at: DateTime<Utc>) -> HandleRef {
    HandleRef {
        instance: instance.name.clone(),
        request_id: instance
            .labels
            .get(REQUEST_ID_LABEL)
            .and_then(|raw| Uuid::parse_str(raw).ok()),
        created_at: Some(created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::{MockIsolationRuntime, RemoveOutcome};
    use std::collections::HashMap;

    fn summary(name: &str, age_secs: i64, now: DateTime<Utc>) -> InstanceSummary {
        InstanceSummary {
            name: name.to_string(),
            created_at: Some(now - TimeDelta::seconds(age_secs)),
            labels: HashMap::from([(OWNER_LABEL.to_string(), "owner".to_string())]),
        }
    }

    #[tokio::test]
    async fn removes_only_expired_and_continues_past_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Utc::now();

        let listed = vec![
            summary("fresh", 10, now),
            summary("old-1", 3600, now),
            summary("old-2", 3600, now),
            summary("old-3", 3600, now),
            InstanceSummary {
                name: "undated".into(),
                created_at: None,
                labels: HashMap::new(),
            },
        ];

        let mut runtime = MockIsolationRuntime::new();
        runtime
            .expect_list_labeled()
            .returning(move |_, _| Ok(listed.clone()));
        runtime.expect_remove().times(3).returning(|name| match name {
            "old-1" => Err(RuntimeError::operation("remove_container", name, "busy")),
            "old-2" => Ok(RemoveOutcome::AlreadyGone),
            _ => Ok(RemoveOutcome::Removed),
        });

        let log = CleanupLog::in_state_dir(tmp.path());
        let reaper = OrphanReaper::new(
            Arc::new(runtime),
            log.clone(),
            "owner",
            Duration::from_secs(300),
            Duration::from_secs(1),
        );

        let report = reaper.sweep_once(now).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 5,
                within_lifetime: 1,
                undated: 1,
                removed: 1,
                already_gone: 1,
                failed: 1,
            }
        );

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(
            entries
                .iter()
                .all(|e| e.record.source == CleanupSource::Reaper)
        );
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_list_labeled().returning(|_, _| {
            Err(RuntimeError::Connect {
                endpoint: "local".into(),
                message: "refused".into(),
            })
        });
        runtime.expect_remove().times(0);

        let reaper = OrphanReaper::new(
            Arc::new(runtime),
            CleanupLog::in_state_dir(tmp.path()),
            "owner",
            Duration::from_secs(300),
            Duration::from_secs(1),
        );
        assert!(reaper.sweep_once(Utc::now()).await.is_err());
    }
}
