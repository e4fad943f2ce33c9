//! Configuration file (`config.toml`).
//!
//! Every section rejects unknown keys, so there is no way to smuggle in an
//! option the engine does not know about (such as a run-without-isolation
//! switch). [`Config::validate`] enforces the cross-field rules.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;
use crate::sandbox::isolation::{DEFAULT_OWNER, DEFAULT_USER, IsolationSettings};
use crate::sandbox::manager::ManagerSettings;
use crate::sandbox::policy::PolicyLimits;
use crate::sandbox::request::{MAX_PROCESS_CEILING, ResourceLimits};
use crate::sandbox::runtime::{RuntimeVersion, SeccompProfile};
use crate::validator::{
    DEFAULT_ALLOWED_MODULES, DEFAULT_MAX_CODE_BYTES, DEFAULT_TIME_ORDERED_INPUTS,
    ValidatorSettings,
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Requests executing at once; the rest queue in FIFO order
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Owner label value and instance name prefix
    #[serde(default = "default_owner")]
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Runtime image with python3 (and the allowed libraries)
    #[serde(default = "default_image")]
    pub image: String,

    /// Timeout for requests that do not set one
    #[serde(default = "default_timeout")]
    pub default_timeout: String,

    /// Upper bound on any request timeout
    #[serde(default = "default_max_timeout")]
    pub max_timeout: String,

    /// Bound on log collection after the script exits
    #[serde(default = "default_output_grace")]
    pub output_grace: String,

    /// Bound on each kill/remove call
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout: String,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Fixed non-root `uid:gid`
    #[serde(default = "default_user")]
    pub user: String,

    /// "default" for the runtime's maintained profile, or a profile file path
    #[serde(default = "default_seccomp_profile")]
    pub seccomp_profile: String,

    /// Block devices that receive the I/O throughput ceilings
    #[serde(default)]
    pub io_devices: Vec<String>,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    #[serde(default = "default_cpus")]
    pub cpus: f64,

    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,

    #[serde(default = "default_scratch_mb")]
    pub scratch_mb: u64,

    #[serde(default = "default_io_bps")]
    pub io_read_bps: u64,

    #[serde(default = "default_io_bps")]
    pub io_write_bps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Docker endpoint; local defaults when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Minimum runtime version
    #[serde(default = "default_version_floor")]
    pub version_floor: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,

    /// Refuse new requests at this many live instances
    #[serde(default = "default_max_live_instances")]
    pub max_live_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reaper_interval")]
    pub interval: String,

    /// Instances older than this are orphans
    #[serde(default = "default_max_instance_age")]
    pub max_instance_age: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,

    #[serde(default = "default_time_ordered_inputs")]
    pub time_ordered_inputs: Vec<String>,

    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_workers() -> usize {
    4
}
fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}
fn default_image() -> String {
    "python:3.12-slim".to_string()
}
fn default_timeout() -> String {
    "30s".to_string()
}
fn default_max_timeout() -> String {
    "5m".to_string()
}
fn default_output_grace() -> String {
    "5s".to_string()
}
fn default_teardown_timeout() -> String {
    "10s".to_string()
}
fn default_max_output_bytes() -> usize {
    MIB as usize
}
fn default_user() -> String {
    DEFAULT_USER.to_string()
}
fn default_seccomp_profile() -> String {
    "default".to_string()
}
fn default_memory_mb() -> u64 {
    512
}
fn default_cpus() -> f64 {
    1.0
}
fn default_max_processes() -> u32 {
    128
}
fn default_max_open_files() -> u64 {
    256
}
fn default_scratch_mb() -> u64 {
    64
}
fn default_io_bps() -> u64 {
    50 * MIB
}
fn default_connect_timeout_secs() -> u64 {
    crate::sandbox::docker::DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_version_floor() -> String {
    "25.0.2".to_string()
}
fn default_probe_timeout() -> String {
    "5s".to_string()
}
fn default_max_live_instances() -> usize {
    32
}
fn default_true() -> bool {
    true
}
fn default_reaper_interval() -> String {
    "1m".to_string()
}
fn default_max_instance_age() -> String {
    "15m".to_string()
}
fn default_allowed_modules() -> Vec<String> {
    DEFAULT_ALLOWED_MODULES.iter().map(|s| s.to_string()).collect()
}
fn default_time_ordered_inputs() -> Vec<String> {
    DEFAULT_TIME_ORDERED_INPUTS
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_code_bytes() -> usize {
    DEFAULT_MAX_CODE_BYTES
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            owner: default_owner(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            default_timeout: default_timeout(),
            max_timeout: default_max_timeout(),
            output_grace: default_output_grace(),
            teardown_timeout: default_teardown_timeout(),
            max_output_bytes: default_max_output_bytes(),
            user: default_user(),
            seccomp_profile: default_seccomp_profile(),
            io_devices: Vec::new(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            max_processes: default_max_processes(),
            max_open_files: default_max_open_files(),
            scratch_mb: default_scratch_mb(),
            io_read_bps: default_io_bps(),
            io_write_bps: default_io_bps(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            version_floor: default_version_floor(),
            probe_timeout: default_probe_timeout(),
            max_live_instances: default_max_live_instances(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reaper_interval(),
            max_instance_age: default_max_instance_age(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_modules: default_allowed_modules(),
            time_ordered_inputs: default_time_ordered_inputs(),
            max_code_bytes: default_max_code_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parse "500ms", "30s", "5m", "1h"; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, s)),
    };
    Ok(duration)
}

fn duration_field(section: &str, key: &str, value: &str) -> Result<Duration> {
    let duration =
        parse_duration(value).map_err(|e| anyhow::anyhow!("{}.{}: {}", section, key, e))?;
    if duration.is_zero() {
        anyhow::bail!("{}.{} must be greater than zero", section, key);
    }
    Ok(duration)
}

fn is_root_identity(user: &str) -> bool {
    user.split(':')
        .any(|part| matches!(part.trim(), "0" | "root"))
}

impl Config {
    /// Load from the resolved config file, creating it from the template on
    /// first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        Self::load_with_paths(paths)
    }

    pub fn load_with_paths(paths: Paths) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Cross-field checks. Every fallible accessor below succeeds after this.
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if self.runtime.max_live_instances == 0 {
            anyhow::bail!("runtime.max_live_instances must be at least 1");
        }
        if self.engine.owner.trim().is_empty() {
            anyhow::bail!("engine.owner must not be empty");
        }
        if self.sandbox.image.trim().is_empty() {
            anyhow::bail!("sandbox.image must not be empty");
        }
        if is_root_identity(&self.sandbox.user) {
            anyhow::bail!(
                "sandbox.user '{}' is a root identity; scripts must run unprivileged",
                self.sandbox.user
            );
        }
        if self.sandbox.max_processes > MAX_PROCESS_CEILING {
            anyhow::bail!(
                "sandbox.max_processes {} exceeds the ceiling of {}",
                self.sandbox.max_processes,
                MAX_PROCESS_CEILING
            );
        }

        self.seccomp_profile()?;
        self.resource_limits()
            .check()
            .map_err(|e| anyhow::anyhow!("sandbox: {}", e))?;
        self.version_floor()?;

        let default_timeout = self.default_timeout()?;
        let max_timeout = self.max_timeout()?;
        if default_timeout > max_timeout {
            anyhow::bail!(
                "sandbox.default_timeout ({}) exceeds sandbox.max_timeout ({})",
                self.sandbox.default_timeout,
                self.sandbox.max_timeout
            );
        }
        let (output_grace, teardown_timeout) = self.timing()?;
        duration_field("runtime", "probe_timeout", &self.runtime.probe_timeout)?;
        duration_field("reaper", "interval", &self.reaper.interval)?;

        // deadline, output collection, then kill and remove
        let lifetime = max_timeout + output_grace + teardown_timeout * 2;
        if self.max_instance_age()? <= lifetime {
            anyhow::bail!(
                "reaper.max_instance_age must exceed the longest request lifetime ({:?})",
                lifetime
            );
        }

        if self.validator.max_code_bytes == 0 {
            anyhow::bail!("validator.max_code_bytes must be greater than zero");
        }
        Ok(())
    }

    fn timing(&self) -> Result<(Duration, Duration)> {
        Ok((
            duration_field("sandbox", "output_grace", &self.sandbox.output_grace)?,
            duration_field("sandbox", "teardown_timeout", &self.sandbox.teardown_timeout)?,
        ))
    }

    pub fn default_timeout(&self) -> Result<Duration> {
        duration_field("sandbox", "default_timeout", &self.sandbox.default_timeout)
    }

    pub fn max_timeout(&self) -> Result<Duration> {
        duration_field("sandbox", "max_timeout", &self.sandbox.max_timeout)
    }

    pub fn max_instance_age(&self) -> Result<Duration> {
        duration_field("reaper", "max_instance_age", &self.reaper.max_instance_age)
    }

    pub fn reaper_interval(&self) -> Result<Duration> {
        duration_field("reaper", "interval", &self.reaper.interval)
    }

    pub fn teardown_timeout(&self) -> Result<Duration> {
        Ok(self.timing()?.1)
    }

    pub fn version_floor(&self) -> Result<RuntimeVersion> {
        self.runtime
            .version_floor
            .parse()
            .map_err(|e| anyhow::anyhow!("runtime.version_floor: {}", e))
    }

    pub fn seccomp_profile(&self) -> Result<SeccompProfile> {
        let raw = self.sandbox.seccomp_profile.trim();
        match raw {
            "default" | "runtime-default" => Ok(SeccompProfile::RuntimeDefault),
            "unconfined" => {
                anyhow::bail!("sandbox.seccomp_profile: 'unconfined' is not allowed")
            }
            path => {
                let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
                if !expanded.is_absolute() {
                    anyhow::bail!(
                        "sandbox.seccomp_profile must be 'default' or an absolute path, got '{}'",
                        raw
                    );
                }
                Ok(SeccompProfile::File(expanded))
            }
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        let s = &self.sandbox;
        ResourceLimits {
            memory_bytes: s.memory_mb.saturating_mul(MIB),
            cpus: s.cpus,
            max_processes: s.max_processes,
            max_open_files: s.max_open_files,
            scratch_bytes: s.scratch_mb.saturating_mul(MIB),
            io_read_bps: s.io_read_bps,
            io_write_bps: s.io_write_bps,
        }
    }

    pub fn isolation_settings(&self) -> Result<IsolationSettings> {
        Ok(IsolationSettings {
            owner: self.engine.owner.clone(),
            user: self.sandbox.user.clone(),
            seccomp: self.seccomp_profile()?,
            io_devices: self.sandbox.io_devices.iter().map(PathBuf::from).collect(),
        })
    }

    pub fn policy_limits(&self) -> Result<PolicyLimits> {
        Ok(PolicyLimits {
            version_floor: self.version_floor()?,
            max_live_instances: self.runtime.max_live_instances,
            probe_timeout: duration_field("runtime", "probe_timeout", &self.runtime.probe_timeout)?,
            seccomp: self.seccomp_profile()?,
        })
    }

    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        let (output_grace, teardown_timeout) = self.timing()?;
        Ok(ManagerSettings {
            isolation: self.isolation_settings()?,
            output_grace,
            teardown_timeout,
            max_output_bytes: self.sandbox.max_output_bytes,
            work_dir: self.paths.work_dir(),
        })
    }

    pub fn validator_settings(&self) -> ValidatorSettings {
        ValidatorSettings {
            allowed_modules: self.validator.allowed_modules.iter().cloned().collect(),
            time_ordered_inputs: self.validator.time_ordered_inputs.iter().cloned().collect(),
            max_code_bytes: self.validator.max_code_bytes,
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["engine", "workers"] => Ok(self.engine.workers.to_string()),
            ["engine", "owner"] => Ok(self.engine.owner.clone()),
            ["sandbox", "image"] => Ok(self.sandbox.image.clone()),
            ["sandbox", "default_timeout"] => Ok(self.sandbox.default_timeout.clone()),
            ["sandbox", "max_timeout"] => Ok(self.sandbox.max_timeout.clone()),
            ["sandbox", "user"] => Ok(self.sandbox.user.clone()),
            ["sandbox", "seccomp_profile"] => Ok(self.sandbox.seccomp_profile.clone()),
            ["sandbox", "memory_mb"] => Ok(self.sandbox.memory_mb.to_string()),
            ["sandbox", "cpus"] => Ok(self.sandbox.cpus.to_string()),
            ["sandbox", "max_processes"] => Ok(self.sandbox.max_processes.to_string()),
            ["runtime", "endpoint"] => Ok(self.runtime.endpoint.clone().unwrap_or_default()),
            ["runtime", "version_floor"] => Ok(self.runtime.version_floor.clone()),
            ["runtime", "max_live_instances"] => Ok(self.runtime.max_live_instances.to_string()),
            ["reaper", "enabled"] => Ok(self.reaper.enabled.to_string()),
            ["reaper", "interval"] => Ok(self.reaper.interval.clone()),
            ["reaper", "max_instance_age"] => Ok(self.reaper.max_instance_age.clone()),
            ["validator", "max_code_bytes"] => Ok(self.validator.max_code_bytes.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# signal-sandbox configuration
# Auto-created on first run. Unknown keys are rejected.

[engine]
workers = 4
owner = "signal-sandbox"              # owner label on every instance

[sandbox]
image = "python:3.12-slim"
default_timeout = "30s"
max_timeout = "5m"
output_grace = "5s"
teardown_timeout = "10s"
user = "65534:65534"                  # root identities are rejected
seccomp_profile = "default"           # or an absolute path to a maintained profile
# io_devices = ["/dev/sda"]           # devices that get the I/O ceilings
memory_mb = 512
cpus = 1.0
max_processes = 128                   # at most 512
max_open_files = 256
scratch_mb = 64

[runtime]
# endpoint = "unix:///var/run/docker.sock"
version_floor = "25.0.2"
probe_timeout = "5s"
max_live_instances = 32

[reaper]
enabled = true
interval = "1m"
max_instance_age = "15m"

[validator]
# allowed_modules = ["math", "numpy", "pandas", "sandbox_result"]
max_code_bytes = 262144

[logging]
level = "info"
"#;
