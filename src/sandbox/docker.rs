//! Docker Engine implementation of [`IsolationRuntime`] (bollard).
//!
//! The hardening baseline lives in [`host_config`] and [`container_body`]:
//! no network, read-only root, dropped capabilities, no-new-privileges,
//! swap disabled. Callers only choose the sizes.

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::LogOutput,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig, ResourcesUlimits, ThrottleDevice},
    query_parameters::{
        CreateContainerOptionsBuilder, KillContainerOptionsBuilder, ListContainersOptionsBuilder,
        LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
        WaitContainerOptionsBuilder,
    },
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::debug;

use super::isolation::CREATED_AT_LABEL;
use super::runtime::{
    CapturedOutput, InstanceSpec, InstanceSummary, IsolationRuntime, RemoveOutcome, RuntimeError,
    RuntimeProbe, SeccompProfile, tail,
};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

impl DockerRuntime {
    /// Connect to `endpoint` (`unix:///path`, a socket path, `tcp://` /
    /// `http://host:port`), or the local defaults when `None`.
    pub fn connect(endpoint: Option<&str>, timeout_secs: u64) -> Result<Self, RuntimeError> {
        let label = endpoint.unwrap_or("local defaults").to_string();
        let connect_error = |source: BollardError| RuntimeError::Connect {
            endpoint: label.clone(),
            message: source.to_string(),
        };

        let docker = match endpoint {
            None => Docker::connect_with_local_defaults().map_err(connect_error)?,
            Some(ep) if ep.starts_with("tcp://") || ep.starts_with("http://") => {
                let addr = ep.replacen("tcp://", "http://", 1);
                Docker::connect_with_http(&addr, timeout_secs, API_DEFAULT_VERSION)
                    .map_err(connect_error)?
            }
            Some(ep) => {
                let path = ep.strip_prefix("unix://").unwrap_or(ep);
                Docker::connect_with_socket(path, timeout_secs, API_DEFAULT_VERSION)
                    .map_err(connect_error)?
            }
        };

        Ok(Self {
            docker,
            endpoint: label,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn operation_error(operation: &'static str, target: &str, source: BollardError) -> RuntimeError {
    if is_not_found_error(&source) {
        return RuntimeError::NotFound(target.to_string());
    }
    RuntimeError::operation(operation, target, source)
}

/// Host-side isolation settings for one instance.
pub fn host_config(spec: &InstanceSpec, seccomp_json: Option<&str>) -> HostConfig {
    let memory = clamp_i64(spec.memory_bytes);

    let mut security_opt = vec!["no-new-privileges:true".to_string()];
    if let Some(profile) = seccomp_json {
        security_opt.push(format!("seccomp={profile}"));
    }

    let throttles = |rate: u64| -> Option<Vec<ThrottleDevice>> {
        if spec.io_devices.is_empty() {
            return None;
        }
        Some(
            spec.io_devices
                .iter()
                .map(|device| ThrottleDevice {
                    path: Some(device.display().to_string()),
                    rate: Some(clamp_i64(rate)),
                })
                .collect(),
        )
    };

    HostConfig {
        binds: Some(vec![spec.code_bind.clone()]),
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        tmpfs: Some(HashMap::from([(
            spec.scratch_path.clone(),
            format!("rw,noexec,nosuid,nodev,size={}", spec.scratch_bytes),
        )])),
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus: Some(spec.nano_cpus),
        pids_limit: Some(spec.pids_limit),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(spec.nofile),
            hard: Some(spec.nofile),
        }]),
        blkio_device_read_bps: throttles(spec.io_read_bps),
        blkio_device_write_bps: throttles(spec.io_write_bps),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(security_opt),
        privileged: Some(false),
        ..HostConfig::default()
    }
}

pub fn container_body(spec: &InstanceSpec, seccomp_json: Option<&str>) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        user: Some(spec.user.clone()),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(spec.labels.clone()),
        network_disabled: Some(true),
        host_config: Some(host_config(spec, seccomp_json)),
        ..ContainerCreateBody::default()
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load a seccomp profile file and compact it for the API.
async fn load_seccomp(profile: &SeccompProfile, target: &str) -> Result<Option<String>, RuntimeError> {
    let SeccompProfile::File(path) = profile else {
        return Ok(None);
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RuntimeError::operation("read_seccomp_profile", target, e))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| RuntimeError::operation("parse_seccomp_profile", target, e))?;
    Ok(Some(parsed.to_string()))
}

/// Append `chunk` to `buf`, dropping the head once it grows past twice the cap.
fn push_bounded(buf: &mut String, chunk: &[u8], max_bytes: usize, truncated: &mut bool) {
    buf.push_str(&String::from_utf8_lossy(chunk));
    if buf.len() > max_bytes.saturating_mul(2) {
        let (kept, _) = tail(buf, max_bytes);
        *buf = kept.to_string();
        *truncated = true;
    }
}

fn summary_created_at(labels: &HashMap<String, String>, created: Option<i64>) -> Option<DateTime<Utc>> {
    labels
        .get(CREATED_AT_LABEL)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| created.and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

#[async_trait]
impl IsolationRuntime for DockerRuntime {
    async fn probe(&self) -> Result<RuntimeProbe, RuntimeError> {
        let connect_error = |source: BollardError| RuntimeError::Connect {
            endpoint: self.endpoint.clone(),
            message: source.to_string(),
        };
        let version = self.docker.version().await.map_err(connect_error)?;
        let info = self.docker.info().await.map_err(connect_error)?;

        Ok(RuntimeProbe {
            version: version.version.unwrap_or_default(),
            mem_total_bytes: info.mem_total.and_then(|m| u64::try_from(m).ok()),
        })
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        let seccomp = load_seccomp(&spec.seccomp, &spec.name).await?;
        let body = container_body(spec, seccomp.as_deref());
        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|source| operation_error("create_container", &spec.name, source))?;
        debug!("Created instance {}", spec.name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|source| operation_error("start_container", name, source))
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(
            name,
            Some(
                WaitContainerOptionsBuilder::new()
                    .condition("not-running")
                    .build(),
            ),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(source)) => Err(operation_error("wait_container", name, source)),
            None => Err(RuntimeError::operation(
                "wait_container",
                name,
                "wait stream ended without a status",
            )),
        }
    }

    async fn logs(&self, name: &str, max_bytes: usize) -> Result<CapturedOutput, RuntimeError> {
        let mut stream = self.docker.logs(
            name,
            Some(
                LogsOptionsBuilder::new()
                    .stdout(true)
                    .stderr(true)
                    .follow(false)
                    .build(),
            ),
        );

        let mut output = CapturedOutput::default();
        let mut truncated = false;
        while let Some(item) = stream.next().await {
            match item.map_err(|source| operation_error("logs", name, source))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    push_bounded(&mut output.stdout, &message, max_bytes, &mut truncated)
                }
                LogOutput::StdErr { message } => {
                    push_bounded(&mut output.stderr, &message, max_bytes, &mut truncated)
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        let (stdout, cut_out) = tail(&output.stdout, max_bytes);
        let (stderr, cut_err) = tail(&output.stderr, max_bytes);
        Ok(CapturedOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            truncated: truncated || cut_out || cut_err,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(
                name,
                Some(KillContainerOptionsBuilder::new().signal("SIGKILL").build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 409: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(source) => Err(operation_error("kill_container", name, source)),
        }
    }

    async fn remove(&self, name: &str) -> Result<RemoveOutcome, RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .link(false)
                        .build(),
                ),
            )
            .await
        {
            Ok(_) => Ok(RemoveOutcome::Removed),
            Err(error) if is_not_found_error(&error) => Ok(RemoveOutcome::AlreadyGone),
            Err(error) => Err(RuntimeError::operation("remove_container", name, error)),
        }
    }

    async fn list_labeled(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceSummary>, RuntimeError> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), vec![format!("{key}={value}")])]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|source| RuntimeError::operation("list_containers", key, source))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let labels = container.labels.unwrap_or_default();
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(container.id)?;
                Some(InstanceSummary {
                    created_at: summary_created_at(&labels, container.created),
                    name,
                    labels,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "signal-sandbox-test".into(),
            image: "python:3.12-slim".into(),
            cmd: vec!["python3".into(), "/sandbox/main.py".into()],
            env: vec!["HOME=/scratch".into()],
            labels: HashMap::from([("signal-sandbox.owner".into(), "signal-sandbox".into())]),
            user: "65534:65534".into(),
            working_dir: "/scratch".into(),
            code_bind: "/tmp/work:/sandbox:ro".into(),
            scratch_path: "/scratch".into(),
            scratch_bytes: 1024,
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 128,
            nofile: 256,
            io_devices: vec![PathBuf::from("/dev/sda")],
            io_read_bps: 1000,
            io_write_bps: 2000,
            seccomp: SeccompProfile::RuntimeDefault,
        }
    }

    #[test]
    fn baseline_is_always_applied() {
        let body = container_body(&spec(), None);
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(body.user.as_deref(), Some("65534:65534"));

        let host = body.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(
            host.tmpfs.unwrap()["/scratch"],
            "rw,noexec,nosuid,nodev,size=1024"
        );
        let nofile = &host.ulimits.unwrap()[0];
        assert_eq!((nofile.soft, nofile.hard), (Some(256), Some(256)));
        let write = host.blkio_device_write_bps.unwrap();
        assert_eq!(write[0].path.as_deref(), Some("/dev/sda"));
        assert_eq!(write[0].rate, Some(2000));
    }

    #[test]
    fn seccomp_profile_is_passed_through() {
        let host = host_config(&spec(), Some(r#"{"defaultAction":"SCMP_ACT_ERRNO"}"#));
        let opts = host.security_opt.unwrap();
        assert_eq!(opts.len(), 2);
        assert!(opts[1].starts_with("seccomp={"));
    }

    #[test]
    fn no_devices_means_no_throttle_entries() {
        let mut spec = spec();
        spec.io_devices.clear();
        let host = host_config(&spec, None);
        assert!(host.blkio_device_read_bps.is_none());
    }

    #[tokio::test]
    async fn seccomp_file_is_compacted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("profile.json");
        std::fs::write(&path, "{\n  \"defaultAction\": \"SCMP_ACT_ERRNO\"\n}\n").unwrap();

        let loaded = load_seccomp(&SeccompProfile::File(path), "t").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(r#"{"defaultAction":"SCMP_ACT_ERRNO"}"#));
        assert_eq!(
            load_seccomp(&SeccompProfile::RuntimeDefault, "t").await.unwrap(),
            None
        );
    }

    #[test]
    fn created_at_prefers_label() {
        let labels = HashMap::from([(
            CREATED_AT_LABEL.to_string(),
            "2026-01-02T03:04:05+00:00".to_string(),
        )]);
        let ts = summary_created_at(&labels, Some(0)).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        let fallback = summary_created_at(&HashMap::new(), Some(60)).unwrap();
        assert_eq!(fallback.timestamp(), 60);
    }
}
