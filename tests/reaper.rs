mod common;

use chrono::{TimeDelta, Utc};
use std::sync::Arc;

use common::{ScriptedRuntime, config_in};
use signal_sandbox::cleanup::{CleanupLog, CleanupOutcome, CleanupSource};
use signal_sandbox::concurrency::SweepLock;
use signal_sandbox::reaper::{ReaperRunner, SweepReport};
use signal_sandbox::sandbox::OWNER_LABEL;
use signal_sandbox::sandbox::isolation::REQUEST_ID_LABEL;

const LEAKED_ID: &str = "5f0c6d1e-8a4b-4c3e-9f2a-1b7d3e6a9c01";

fn leaky_runtime() -> ScriptedRuntime {
    let now = Utc::now();
    ScriptedRuntime::new()
        .with_instance(
            "signal-sandbox-leaked",
            Some(now - TimeDelta::hours(2)),
            &[(OWNER_LABEL, "signal-sandbox"), (REQUEST_ID_LABEL, LEAKED_ID)],
        )
        .with_instance(
            "signal-sandbox-running",
            Some(now - TimeDelta::seconds(30)),
            &[(OWNER_LABEL, "signal-sandbox")],
        )
        .with_instance(
            "signal-sandbox-undated",
            None,
            &[(OWNER_LABEL, "signal-sandbox")],
        )
        .with_instance(
            "someone-elses",
            Some(now - TimeDelta::days(3)),
            &[(OWNER_LABEL, "other-service")],
        )
}

#[tokio::test]
async fn sweep_removes_expired_instances_once() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let runtime = Arc::new(leaky_runtime());
    let runner = ReaperRunner::from_config(&config, runtime.clone()).unwrap();

    let report = runner.run_once().await.unwrap().unwrap();
    assert_eq!(
        report,
        SweepReport {
            examined: 3,
            within_lifetime: 1,
            undated: 1,
            removed: 1,
            ..SweepReport::default()
        }
    );
    assert_eq!(runtime.removed(), vec!["signal-sandbox-leaked".to_string()]);
    assert_eq!(runtime.live_count(), 3);

    let entries = CleanupLog::new(config.paths.cleanup_log()).read_all().unwrap();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].record;
    assert_eq!(record.source, CleanupSource::Reaper);
    assert_eq!(record.outcome, CleanupOutcome::Removed);
    assert_eq!(record.handle.request_id.map(|id| id.to_string()).as_deref(), Some(LEAKED_ID));

    // A second sweep finds nothing new to remove.
    let again = runner.run_once().await.unwrap().unwrap();
    assert_eq!(again.removed, 0);
    assert_eq!(again.examined, 2);
    assert_eq!(runtime.removed().len(), 1);
    assert!(
        CleanupLog::new(config.paths.cleanup_log())
            .verify_chain()
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn concurrent_sweeper_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let runtime = Arc::new(leaky_runtime());
    let runner = ReaperRunner::from_config(&config, runtime.clone()).unwrap();

    let held = SweepLock::new(config.paths.sweep_lock());
    let _guard = held.acquire().unwrap();

    assert!(runner.run_once().await.unwrap().is_none());
    assert!(runtime.removed().is_empty());
}

#[tokio::test]
async fn unreachable_runtime_fails_the_sweep() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let runtime = Arc::new(leaky_runtime().unreachable());
    let runner = ReaperRunner::from_config(&config, runtime).unwrap();

    assert!(runner.run_once().await.is_err());
}
