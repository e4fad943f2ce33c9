mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedRuntime, config_in, emitting};
use signal_sandbox::Engine;
use signal_sandbox::cleanup::{CleanupLog, CleanupOutcome, CleanupSource};
use signal_sandbox::sandbox::ExecutionResult;
use signal_sandbox::validator::RuleId;

const SCRIPT: &str = "\
import math
from sandbox_result import emit

closes = [100.0, 101.5, 99.8, 102.3]
returns = [b / a - 1 for a, b in zip(closes, closes[1:])]
emit({'mean_return': sum(returns) / len(returns), 'vol': math.sqrt(0.0004)})
";

fn engine(runtime: &Arc<ScriptedRuntime>, root: &std::path::Path) -> Engine {
    Engine::with_runtime(&config_in(root), runtime.clone()).unwrap()
}

#[tokio::test]
async fn valid_script_returns_signal() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        ScriptedRuntime::new().prints(&format!(
            "warming up\n{}",
            emitting(r#"{"mean_return": 0.0076, "vol": 0.02}"#)
        )),
    );
    let engine = engine(&runtime, tmp.path());

    let request = engine.request(SCRIPT).parameter("window", 3).build().unwrap();
    let result = engine.execute(&request).await;

    let ExecutionResult::Success { signal } = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(signal["vol"], 0.02);
    assert_eq!(runtime.created().len(), 1);
    assert_eq!(runtime.removed(), runtime.created());
    assert_eq!(runtime.live_count(), 0);
    assert_eq!(engine.alerts().raised(), 0);
}

#[tokio::test]
async fn rejected_script_never_reaches_the_runtime() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    let engine = engine(&runtime, tmp.path());

    let request = engine
        .request("import importlib\nmod = importlib.import_module('os')\n")
        .build()
        .unwrap();
    let result = engine.execute(&request).await;

    let ExecutionResult::Rejected { violations } = result else {
        panic!("expected rejection, got {result:?}");
    };
    assert!(!violations.is_empty());
    assert!(violations.iter().all(|v| v.rule_id == RuleId::NoDynamicImport));
    assert!(runtime.created().is_empty());
    assert!(
        CleanupLog::new(config_in(tmp.path()).paths.cleanup_log())
            .read_all()
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn missing_marker_is_a_runtime_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new().prints("computed but forgot to emit\n"));
    let engine = engine(&runtime, tmp.path());

    let request = engine.request(SCRIPT).build().unwrap();
    assert_eq!(
        engine.execute(&request).await,
        ExecutionResult::RuntimeFailure {
            message: "no result emitted".into()
        }
    );
    assert_eq!(runtime.live_count(), 0);
}

#[tokio::test]
async fn non_zero_exit_carries_stderr() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        ScriptedRuntime::new()
            .exits_with(1)
            .prints(&emitting(r#"{"vol": 0.02}"#))
            .prints_err("ZeroDivisionError: float division by zero\n"),
    );
    let engine = engine(&runtime, tmp.path());

    let request = engine.request(SCRIPT).build().unwrap();
    let ExecutionResult::RuntimeFailure { message } = engine.execute(&request).await else {
        panic!("expected failure");
    };
    assert!(message.contains("status 1"));
    assert!(message.contains("ZeroDivisionError"));
}

#[tokio::test(start_paused = true)]
async fn overrunning_script_times_out_and_is_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new().runs_for(Duration::from_secs(3600)));
    let engine = engine(&runtime, tmp.path());

    let request = engine
        .request(SCRIPT)
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    assert_eq!(engine.execute(&request).await, ExecutionResult::Timeout);

    assert_eq!(runtime.killed().len(), 1);
    assert_eq!(runtime.live_count(), 0);

    let entries = CleanupLog::new(config_in(tmp.path()).paths.cleanup_log())
        .read_all()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.outcome, CleanupOutcome::Removed);
    assert_eq!(entries[0].record.source, CleanupSource::Request);
    assert_eq!(entries[0].record.handle.request_id, Some(request.id()));
}

#[tokio::test]
async fn unreachable_runtime_fails_closed_with_one_alert() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new().unreachable());
    let engine = engine(&runtime, tmp.path());
    let mut alerts = engine.alerts().subscribe();

    let request = engine.request(SCRIPT).build().unwrap();
    let result = engine.execute(&request).await;

    assert!(matches!(result, ExecutionResult::SandboxUnavailable { .. }));
    assert!(runtime.created().is_empty());
    assert_eq!(engine.alerts().raised(), 1);
    let event = alerts.try_recv().unwrap();
    assert_eq!(event.request_id, Some(request.id()));
}

#[tokio::test]
async fn outdated_runtime_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new().version("20.10.7"));
    let engine = engine(&runtime, tmp.path());

    let request = engine.request(SCRIPT).build().unwrap();
    let ExecutionResult::SandboxUnavailable { reason } = engine.execute(&request).await else {
        panic!("expected unavailable");
    };
    assert!(reason.contains("20.10.7"));
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn batch_results_keep_request_order_and_each_handle_is_cleaned_once() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new().prints(&emitting(r#"{"sharpe": 1.1}"#)));
    let engine = engine(&runtime, tmp.path());

    let requests = vec![
        engine.request(SCRIPT).build().unwrap(),
        engine.request("import subprocess\n").build().unwrap(),
        engine.request(SCRIPT).build().unwrap(),
        engine.request(SCRIPT).build().unwrap(),
    ];
    let statuses: Vec<_> = engine
        .execute_all(&requests)
        .await
        .iter()
        .map(|r| r.status())
        .collect();
    assert_eq!(statuses, ["success", "rejected", "success", "success"]);

    let entries = CleanupLog::new(config_in(tmp.path()).paths.cleanup_log())
        .read_all()
        .unwrap();
    assert_eq!(entries.len(), 3);
    let mut instances: Vec<_> = entries.iter().map(|e| e.record.handle.instance.clone()).collect();
    instances.sort();
    instances.dedup();
    assert_eq!(instances.len(), 3);
    assert_eq!(runtime.live_count(), 0);
}

#[tokio::test]
async fn resubmitted_request_runs_in_separate_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        ScriptedRuntime::new()
            .runs_for(Duration::from_millis(20))
            .prints(&emitting(r#"{"sharpe": 0.4}"#)),
    );
    let engine = engine(&runtime, tmp.path());

    let request = engine.request(SCRIPT).build().unwrap();
    let results = engine
        .execute_all(&[request.clone(), request.clone()])
        .await;
    assert!(results.iter().all(ExecutionResult::is_success), "{results:?}");

    let mut created = runtime.created();
    assert_eq!(created.len(), 2);
    created.dedup();
    assert_eq!(created.len(), 2);
    assert_eq!(runtime.live_count(), 0);

    let entries = CleanupLog::new(config_in(tmp.path()).paths.cleanup_log())
        .read_all()
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(
        entries
            .iter()
            .all(|e| e.record.handle.request_id == Some(request.id()))
    );
}
