//! Owns one isolated execution from materialization to teardown.
//!
//! A run holds a [`TeardownGuard`] from before the instance is created
//! until after it is removed. The normal path tears down explicitly; if the
//! owning future is dropped or panics, the guard's `Drop` schedules the
//! removal on the current tokio runtime instead.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::isolation::{IsolationSettings, build_instance_spec};
use super::materialize::materialize;
use super::policy::IsolationGrant;
use super::request::ExecutionRequest;
use super::result::ExecutionResult;
use super::runtime::{CapturedOutput, InstanceSpec, IsolationRuntime, SandboxHandle, tail};
use crate::cleanup::{CleanupLog, CleanupOutcome, CleanupSource, HandleRef, remove_and_record};
use crate::protocol;
use crate::validator::Clearance;

pub const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How much stderr a failure message carries.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub isolation: IsolationSettings,
    /// Bound on output collection after the process exits.
    pub output_grace: Duration,
    /// Bound on each kill/remove call.
    pub teardown_timeout: Duration,
    pub max_output_bytes: usize,
    /// Parent of the per-request code directories.
    pub work_dir: PathBuf,
}

impl ManagerSettings {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            isolation: IsolationSettings::default(),
            output_grace: DEFAULT_OUTPUT_GRACE,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            work_dir: work_dir.into(),
        }
    }
}

pub struct SandboxManager {
    runtime: Arc<dyn IsolationRuntime>,
    cleanup: CleanupLog,
    settings: ManagerSettings,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn IsolationRuntime>, cleanup: CleanupLog, settings: ManagerSettings) -> Self {
        Self {
            runtime,
            cleanup,
            settings,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Run `request` in a fresh isolated instance. Always returns exactly
    /// one result and always tears the instance down.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        clearance: &Clearance,
        grant: &IsolationGrant,
    ) -> ExecutionResult {
        if !clearance.covers(request.code()) {
            return ExecutionResult::unavailable("clearance was issued for different code");
        }
        if grant.request_id() != request.id() {
            return ExecutionResult::unavailable("isolation grant was issued for another request");
        }

        let deadline = Instant::now() + request.timeout();

        let code_dir = match materialize(&self.settings.work_dir, request) {
            Ok(dir) => dir,
            Err(e) => {
                return ExecutionResult::unavailable(format!(
                    "failed to prepare code directory: {e:#}"
                ));
            }
        };

        let created_at = Utc::now();
        let spec = build_instance_spec(
            &self.settings.isolation,
            request,
            Uuid::new_v4(),
            code_dir.path(),
            created_at,
        );
        let handle = SandboxHandle {
            name: spec.name.clone(),
            request_id: request.id(),
            created_at,
        };
        let guard = TeardownGuard::arm(
            self.runtime.clone(),
            self.cleanup.clone(),
            &handle,
            self.settings.teardown_timeout,
        );

        debug!("Running request {} in {}", request.id(), handle.name);
        let result = self.execute(&spec, deadline).await;

        guard.teardown().await;
        drop(code_dir);

        info!("Request {} finished: {}", request.id(), result.status());
        result
    }

    async fn execute(&self, spec: &InstanceSpec, deadline: Instant) -> ExecutionResult {
        let runtime = &self.runtime;
        let lifecycle = async {
            runtime.create(spec).await?;
            runtime.start(&spec.name).await?;
            runtime.wait(&spec.name).await
        };

        let exit = match tokio::time::timeout_at(deadline, lifecycle).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return ExecutionResult::unavailable(e.to_string()),
            Err(_) => {
                info!("Instance {} exceeded its deadline, killing", spec.name);
                match tokio::time::timeout(self.settings.teardown_timeout, runtime.kill(&spec.name))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to kill {}: {}", spec.name, e),
                    Err(_) => warn!("Kill of {} timed out", spec.name),
                }
                return ExecutionResult::Timeout;
            }
        };

        let output = match tokio::time::timeout(
            self.settings.output_grace,
            runtime.logs(&spec.name, self.settings.max_output_bytes),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ExecutionResult::unavailable(e.to_string()),
            Err(_) => {
                return ExecutionResult::unavailable(format!(
                    "output collection for {} timed out",
                    spec.name
                ));
            }
        };
        if output.truncated {
            debug!("Output of {} was truncated", spec.name);
        }

        interpret(exit, &output)
    }
}

/// Map an exit status and captured output to a result.
pub fn interpret(exit: i64, output: &CapturedOutput) -> ExecutionResult {
    if exit != 0 {
        let (stderr, _) = tail(output.stderr.trim_end(), STDERR_TAIL_BYTES);
        let message = if stderr.is_empty() {
            format!("script exited with status {exit}")
        } else {
            format!("script exited with status {exit}: {stderr}")
        };
        return ExecutionResult::RuntimeFailure { message };
    }

    match protocol::decode(&output.stdout) {
        Ok(signal) => ExecutionResult::Success { signal },
        Err(e) => ExecutionResult::RuntimeFailure {
            message: e.to_string(),
        },
    }
}

/// Guarantees one teardown per handle.
struct TeardownGuard {
    armed: Option<Teardown>,
}

struct Teardown {
    runtime: Arc<dyn IsolationRuntime>,
    log: CleanupLog,
    handle: HandleRef,
    timeout: Duration,
}

impl Teardown {
    async fn run(self) -> CleanupOutcome {
        remove_and_record(
            self.runtime.as_ref(),
            &self.log,
            self.handle,
            self.timeout,
            CleanupSource::Request,
        )
        .await
    }
}

impl TeardownGuard {
    fn arm(
        runtime: Arc<dyn IsolationRuntime>,
        log: CleanupLog,
        handle: &SandboxHandle,
        timeout: Duration,
    ) -> Self {
        Self {
            armed: Some(Teardown {
                runtime,
                log,
                handle: HandleRef {
                    instance: handle.name.clone(),
                    request_id: Some(handle.request_id),
                    created_at: Some(handle.created_at),
                },
                timeout,
            }),
        }
    }

    async fn teardown(mut self) -> Option<CleanupOutcome> {
        match self.armed.take() {
            Some(teardown) => Some(teardown.run().await),
            None => None,
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(teardown) = self.armed.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!("Scheduling teardown of abandoned {}", teardown.handle.instance);
                rt.spawn(teardown.run());
            }
            Err(_) => warn!(
                "No async runtime to tear down {}; left for the reaper",
                teardown.handle.instance
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::IsolationGrant;
    use crate::sandbox::runtime::{
        InstanceSummary, MockIsolationRuntime, RemoveOutcome, RuntimeError, RuntimeProbe,
    };
    use crate::validator::Validator;

    const CODE: &str = "from sandbox_result import emit\nemit({'sharpe': 1.5})\n";

    fn request() -> ExecutionRequest {
        ExecutionRequest::builder(CODE, "python:3.12-slim")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn manager(runtime: MockIsolationRuntime, tmp: &std::path::Path) -> SandboxManager {
        SandboxManager::new(
            Arc::new(runtime),
            CleanupLog::in_state_dir(tmp),
            ManagerSettings::new(tmp.join("work")),
        )
    }

    fn clearance(code: &str) -> Clearance {
        Validator::default().validate(code).clearance().unwrap()
    }

    #[test]
    fn interpret_exit_and_output() {
        let ok = CapturedOutput {
            stdout: "noise\n<<<RESULT_START>>>{\"sharpe\": 1.5}<<<RESULT_END>>>\n".into(),
            ..CapturedOutput::default()
        };
        assert!(interpret(0, &ok).is_success());

        let silent = CapturedOutput::default();
        assert_eq!(
            interpret(0, &silent),
            ExecutionResult::RuntimeFailure {
                message: "no result emitted".into()
            }
        );

        let crashed = CapturedOutput {
            stderr: "Traceback...\nZeroDivisionError: division by zero\n".into(),
            ..ok.clone()
        };
        let ExecutionResult::RuntimeFailure { message } = interpret(1, &crashed) else {
            panic!("expected failure");
        };
        assert!(message.starts_with("script exited with status 1: "));
        assert!(message.ends_with("division by zero"));

        assert_eq!(
            interpret(137, &silent),
            ExecutionResult::RuntimeFailure {
                message: "script exited with status 137".into()
            }
        );
    }

    #[tokio::test]
    async fn successful_run_tears_down_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_create().times(1).returning(|_| Ok(()));
        runtime.expect_start().times(1).returning(|_| Ok(()));
        runtime.expect_wait().times(1).returning(|_| Ok(0));
        runtime.expect_logs().times(1).returning(|_, _| {
            Ok(CapturedOutput {
                stdout: "<<<RESULT_START>>>{\"sharpe\": 1.5}<<<RESULT_END>>>".into(),
                ..CapturedOutput::default()
            })
        });
        runtime
            .expect_remove()
            .times(1)
            .returning(|_| Ok(RemoveOutcome::Removed));

        let manager = manager(runtime, tmp.path());
        let request = request();
        let result = manager
            .run(&request, &clearance(CODE), &IsolationGrant::for_tests(request.id()))
            .await;

        let ExecutionResult::Success { signal } = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(signal["sharpe"], 1.5);

        let entries = CleanupLog::in_state_dir(tmp.path()).read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.outcome, CleanupOutcome::Removed);
        assert_eq!(entries[0].record.handle.request_id, Some(request.id()));
    }

    #[tokio::test]
    async fn start_failure_is_unavailable_and_still_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_create().returning(|_| Ok(()));
        runtime.expect_start().returning(|name| {
            Err(RuntimeError::operation("start_container", name, "oci runtime error"))
        });
        runtime.expect_wait().times(0);
        runtime
            .expect_remove()
            .times(1)
            .returning(|_| Ok(RemoveOutcome::Removed));

        let manager = manager(runtime, tmp.path());
        let request = request();
        let result = manager
            .run(&request, &clearance(CODE), &IsolationGrant::for_tests(request.id()))
            .await;

        let ExecutionResult::SandboxUnavailable { reason } = result else {
            panic!("expected unavailable");
        };
        assert!(reason.contains("oci runtime error"));
        assert_eq!(CleanupLog::in_state_dir(tmp.path()).read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_removal_keeps_the_result_and_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_create().returning(|_| Ok(()));
        runtime.expect_start().returning(|_| Ok(()));
        runtime.expect_wait().returning(|_| Ok(0));
        runtime.expect_logs().returning(|_, _| {
            Ok(CapturedOutput {
                stdout: "<<<RESULT_START>>>{\"sharpe\": 1.5}<<<RESULT_END>>>".into(),
                ..CapturedOutput::default()
            })
        });
        runtime.expect_remove().times(1).returning(|name| {
            Err(RuntimeError::operation("remove_container", name, "device or resource busy"))
        });

        let manager = manager(runtime, tmp.path());
        let request = request();
        let result = manager
            .run(&request, &clearance(CODE), &IsolationGrant::for_tests(request.id()))
            .await;
        assert!(result.is_success(), "got {result:?}");

        let entries = CleanupLog::in_state_dir(tmp.path()).read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.outcome, CleanupOutcome::Failed);
        assert!(
            entries[0]
                .record
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("device or resource busy"))
        );
    }

    /// Starts instances that never exit.
    #[derive(Default)]
    struct StuckRuntime {
        removed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IsolationRuntime for StuckRuntime {
        async fn probe(&self) -> Result<RuntimeProbe, RuntimeError> {
            Err(RuntimeError::NotFound("probe".into()))
        }

        async fn create(&self, _spec: &InstanceSpec) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn start(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn wait(&self, _name: &str) -> Result<i64, RuntimeError> {
            std::future::pending().await
        }

        async fn logs(&self, _name: &str, _max_bytes: usize) -> Result<CapturedOutput, RuntimeError> {
            Ok(CapturedOutput::default())
        }

        async fn kill(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<RemoveOutcome, RuntimeError> {
            self.removed.lock().unwrap().push(name.to_string());
            Ok(RemoveOutcome::Removed)
        }

        async fn list_labeled(
            &self,
            _key: &str,
            _value: &str,
        ) -> Result<Vec<InstanceSummary>, RuntimeError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn abandoned_run_is_torn_down_once() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(StuckRuntime::default());
        let manager = SandboxManager::new(
            runtime.clone(),
            CleanupLog::in_state_dir(tmp.path()),
            ManagerSettings::new(tmp.path().join("work")),
        );
        let request = request();
        let clearance = clearance(CODE);
        let grant = IsolationGrant::for_tests(request.id());

        // The caller gives up while the script is still running.
        let run = manager.run(&request, &clearance, &grant);
        assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());

        let log = CleanupLog::in_state_dir(tmp.path());
        let mut entries = Vec::new();
        for _ in 0..200 {
            entries = log.read_all().unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.read_all().unwrap().len(), 1);
        assert_eq!(entries[0].record.outcome, CleanupOutcome::Removed);
        assert_eq!(entries[0].record.handle.request_id, Some(request.id()));
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_tokens_are_refused_before_any_runtime_call() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runtime = MockIsolationRuntime::new();
        runtime.expect_create().times(0);

        let manager = manager(runtime, tmp.path());
        let request = request();

        let result = manager
            .run(
                &request,
                &clearance("x = 1\n"),
                &IsolationGrant::for_tests(request.id()),
            )
            .await;
        assert_eq!(result.status(), "sandbox_unavailable");

        let result = manager
            .run(
                &request,
                &clearance(CODE),
                &IsolationGrant::for_tests(uuid::Uuid::new_v4()),
            )
            .await;
        assert_eq!(result.status(), "sandbox_unavailable");
    }
}
