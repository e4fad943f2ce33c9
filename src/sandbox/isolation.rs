//! Least-privilege instance specification.
//!
//! Turns a request plus the operator's isolation settings into an
//! [`InstanceSpec`]. The network, filesystem, capability and privilege
//! baseline is applied by the runtime adapter and has no knobs here; only
//! the sizes of the ceilings come from the request.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::request::ExecutionRequest;
use super::runtime::{InstanceSpec, SeccompProfile};
use crate::protocol::PARAMS_ENV;

pub const OWNER_LABEL: &str = "signal-sandbox.owner";
pub const REQUEST_ID_LABEL: &str = "signal-sandbox.request-id";
pub const CREATED_AT_LABEL: &str = "signal-sandbox.created-at";

pub const DEFAULT_OWNER: &str = "signal-sandbox";
pub const DEFAULT_USER: &str = "65534:65534";

/// Where the code directory appears inside the instance.
pub const CODE_MOUNT: &str = "/sandbox";
pub const SCRATCH_MOUNT: &str = "/scratch";
pub const ENTRYPOINT: &str = "main.py";
pub const PARAMS_FILE: &str = "params.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationSettings {
    /// Value of [`OWNER_LABEL`] and instance name prefix.
    pub owner: String,
    /// Fixed `uid:gid` the script runs as.
    pub user: String,
    pub seccomp: SeccompProfile,
    /// Block devices that receive the I/O throughput ceilings.
    pub io_devices: Vec<PathBuf>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            owner: DEFAULT_OWNER.to_string(),
            user: DEFAULT_USER.to_string(),
            seccomp: SeccompProfile::RuntimeDefault,
            io_devices: Vec::new(),
        }
    }
}

/// Instances are named per run, so resubmitting a request never reuses a
/// live instance's name.
pub fn instance_name(owner: &str, run_id: Uuid) -> String {
    format!("{}-{}", owner, run_id)
}

/// Labels carried by every instance so the reaper can find it.
pub fn instance_labels(
    owner: &str,
    request: &ExecutionRequest,
    created_at: DateTime<Utc>,
) -> HashMap<String, String> {
    HashMap::from([
        (OWNER_LABEL.to_string(), owner.to_string()),
        (REQUEST_ID_LABEL.to_string(), request.id().to_string()),
        (CREATED_AT_LABEL.to_string(), created_at.to_rfc3339()),
    ])
}

pub fn build_instance_spec(
    settings: &IsolationSettings,
    request: &ExecutionRequest,
    run_id: Uuid,
    code_dir: &Path,
    created_at: DateTime<Utc>,
) -> InstanceSpec {
    let limits = request.resource_limits();

    InstanceSpec {
        name: instance_name(&settings.owner, run_id),
        image: request.runtime_image().to_string(),
        cmd: vec![
            "python3".to_string(),
            "-B".to_string(),
            "-s".to_string(),
            format!("{CODE_MOUNT}/{ENTRYPOINT}"),
        ],
        env: vec![
            format!("HOME={SCRATCH_MOUNT}"),
            format!("TMPDIR={SCRATCH_MOUNT}"),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
            format!("{PARAMS_ENV}={CODE_MOUNT}/{PARAMS_FILE}"),
        ],
        labels: instance_labels(&settings.owner, request, created_at),
        user: settings.user.clone(),
        working_dir: SCRATCH_MOUNT.to_string(),
        code_bind: format!("{}:{CODE_MOUNT}:ro", code_dir.display()),
        scratch_path: SCRATCH_MOUNT.to_string(),
        scratch_bytes: limits.scratch_bytes,
        memory_bytes: limits.memory_bytes,
        nano_cpus: (limits.cpus * 1_000_000_000.0).round() as i64,
        pids_limit: i64::from(limits.max_processes),
        nofile: limits.max_open_files.min(i64::MAX as u64) as i64,
        io_devices: settings.io_devices.clone(),
        io_read_bps: limits.io_read_bps,
        io_write_bps: limits.io_write_bps,
        seccomp: settings.seccomp.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::request::ResourceLimits;

    fn request() -> ExecutionRequest {
        ExecutionRequest::builder("print(1)", "python:3.12-slim")
            .resource_limits(ResourceLimits {
                cpus: 0.5,
                max_processes: 64,
                ..ResourceLimits::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn spec_carries_request_limits_and_labels() {
        let request = request();
        let created = Utc::now();
        let run_id = Uuid::new_v4();
        let spec = build_instance_spec(
            &IsolationSettings::default(),
            &request,
            run_id,
            Path::new("/var/cache/signal-sandbox/work/abc"),
            created,
        );

        assert_eq!(spec.name, format!("signal-sandbox-{}", run_id));
        assert_eq!(spec.nano_cpus, 500_000_000);
        assert_eq!(spec.pids_limit, 64);
        assert_eq!(spec.user, "65534:65534");
        assert_eq!(
            spec.code_bind,
            "/var/cache/signal-sandbox/work/abc:/sandbox:ro"
        );
        assert_eq!(spec.labels[OWNER_LABEL], "signal-sandbox");
        assert_eq!(spec.labels[REQUEST_ID_LABEL], request.id().to_string());
        assert_eq!(spec.labels[CREATED_AT_LABEL], created.to_rfc3339());
        assert!(spec.env.contains(&"SANDBOX_PARAMS=/sandbox/params.json".to_string()));
        assert_eq!(spec.cmd.last().map(String::as_str), Some("/sandbox/main.py"));
    }
}
