//! Isolation runtime abstraction.
//!
//! Everything the engine needs from a container runtime goes through
//! [`IsolationRuntime`]. The Docker implementation lives in
//! [`super::docker`]; tests substitute a mock or a scripted fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot connect to isolation runtime at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("{operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("instance {0} not found")]
    NotFound(String),
}

impl RuntimeError {
    pub fn operation(operation: &'static str, target: &str, message: impl fmt::Display) -> Self {
        RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message: message.to_string(),
        }
    }
}

/// Reachability facts from a runtime probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProbe {
    pub version: String,
    pub mem_total_bytes: Option<u64>,
}

/// Semantic runtime version, tolerant of vendor suffixes ("25.0.3-ce",
/// "v26.1.0", "24.0.7+dfsg1").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparsable runtime version '{0}'")]
pub struct VersionParseError(pub String);

impl FromStr for RuntimeVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let trimmed = raw.strip_prefix('v').unwrap_or(raw);
        let core = trimmed
            .split(['-', '+', ' '])
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u32, VersionParseError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| VersionParseError(s.to_string())),
                None if required => Err(VersionParseError(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(Self::new(major, minor, patch))
    }
}

/// Seccomp profile applied to every instance. There is no unconfined
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeccompProfile {
    /// The runtime's maintained default profile.
    RuntimeDefault,
    /// A maintained profile file, passed to the runtime as-is.
    File(PathBuf),
}

/// Fully resolved description of one isolated instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub user: String,
    pub working_dir: String,
    /// `host:container:ro` bind of the materialized code directory.
    pub code_bind: String,
    pub scratch_path: String,
    pub scratch_bytes: u64,
    pub memory_bytes: u64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub nofile: i64,
    pub io_devices: Vec<PathBuf>,
    pub io_read_bps: u64,
    pub io_write_bps: u64,
    pub seccomp: SeccompProfile,
}

/// Bounded capture of an instance's output streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    AlreadyGone,
}

/// A labelled instance as reported by `list_labeled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// Identity of one created instance. Owned by exactly one manager run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Reachability, version and host memory.
    async fn probe(&self) -> Result<RuntimeProbe, RuntimeError>;

    async fn create(&self, spec: &InstanceSpec) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Wait until the instance stops; returns its exit status.
    async fn wait(&self, name: &str) -> Result<i64, RuntimeError>;

    /// Collect stdout/stderr, keeping at most `max_bytes` of each (the tail).
    async fn logs(&self, name: &str, max_bytes: usize) -> Result<CapturedOutput, RuntimeError>;

    async fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-remove the instance and its anonymous volumes.
    async fn remove(&self, name: &str) -> Result<RemoveOutcome, RuntimeError>;

    /// All instances (running or not) whose label `key` equals `value`.
    async fn list_labeled(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceSummary>, RuntimeError>;
}

/// Keep the last `max_bytes` of `text`, cut at a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    (&text[start..], true)
}
