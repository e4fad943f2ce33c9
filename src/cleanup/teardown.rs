use std::time::Duration;
use tracing::{debug, warn};

use super::{CleanupLog, CleanupOutcome, CleanupRecord, CleanupSource, HandleRef};
use crate::sandbox::runtime::{IsolationRuntime, RemoveOutcome, RuntimeError};

/// Force-remove one instance and append exactly one record for the
/// attempt. Never fails; failures are logged and recorded.
pub async fn remove_and_record(
    runtime: &dyn IsolationRuntime,
    log: &CleanupLog,
    handle: HandleRef,
    timeout: Duration,
    source: CleanupSource,
) -> CleanupOutcome {
    let (outcome, detail) = match tokio::time::timeout(timeout, runtime.remove(&handle.instance)).await {
        Ok(Ok(RemoveOutcome::Removed)) => (CleanupOutcome::Removed, None),
        Ok(Ok(RemoveOutcome::AlreadyGone)) | Ok(Err(RuntimeError::NotFound(_))) => {
            (CleanupOutcome::AlreadyGone, None)
        }
        Ok(Err(e)) => (CleanupOutcome::Failed, Some(e.to_string())),
        Err(_) => (
            CleanupOutcome::Failed,
            Some(format!("removal timed out after {timeout:?}")),
        ),
    };

    match &detail {
        Some(detail) => warn!(
            "Failed to remove instance {}: {}; left for the reaper",
            handle.instance, detail
        ),
        None => debug!("Instance {} cleaned up ({:?})", handle.instance, outcome),
    }

    let instance = handle.instance.clone();
    let record = CleanupRecord::new(handle, outcome, source, detail);
    let log = log.clone();
    match tokio::task::spawn_blocking(move || log.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to record cleanup of {}: {:#}", instance, e),
        Err(e) => warn!("Cleanup record task for {} failed: {}", instance, e),
    }

    outcome
}
