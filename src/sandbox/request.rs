use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Hard ceiling on processes inside one instance.
pub const MAX_PROCESS_CEILING: u32 = 512;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource ceilings applied to one isolated instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// CPU share in cores (0.5 = half a core).
    pub cpus: f64,
    pub max_processes: u32,
    pub max_open_files: u64,
    /// Size of the writable tmpfs scratch area.
    pub scratch_bytes: u64,
    /// Per-device read throughput ceiling, bytes/second.
    pub io_read_bps: u64,
    /// Per-device write throughput ceiling, bytes/second.
    pub io_write_bps: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpus: 1.0,
            max_processes: 128,
            max_open_files: 256,
            scratch_bytes: 64 * 1024 * 1024,
            io_read_bps: 50 * 1024 * 1024,
            io_write_bps: 50 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn check(&self) -> Result<(), RequestError> {
        if self.memory_bytes == 0 {
            return Err(RequestError::Limit("memory ceiling must be positive"));
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return Err(RequestError::Limit("CPU share must be a positive number"));
        }
        if self.max_processes == 0 || self.max_processes > MAX_PROCESS_CEILING {
            return Err(RequestError::Limit(
                "process ceiling must be between 1 and 512",
            ));
        }
        if self.max_open_files == 0 {
            return Err(RequestError::Limit("open-file ceiling must be positive"));
        }
        if self.scratch_bytes == 0 {
            return Err(RequestError::Limit("scratch size must be positive"));
        }
        if self.io_read_bps == 0 || self.io_write_bps == 0 {
            return Err(RequestError::Limit("I/O ceilings must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("runtime image must not be empty")]
    EmptyImage,
    #[error("invalid resource limits: {0}")]
    Limit(&'static str),
}

/// One unit of work. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    id: Uuid,
    code: String,
    parameters: Map<String, Value>,
    timeout: Duration,
    resource_limits: ResourceLimits,
    runtime_image: String,
}

impl ExecutionRequest {
    pub fn builder(code: impl Into<String>, runtime_image: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder {
            id: None,
            code: code.into(),
            parameters: Map::new(),
            timeout: DEFAULT_TIMEOUT,
            resource_limits: ResourceLimits::default(),
            runtime_image: runtime_image.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.resource_limits
    }

    pub fn runtime_image(&self) -> &str {
        &self.runtime_image
    }
}

pub struct ExecutionRequestBuilder {
    id: Option<Uuid>,
    code: String,
    parameters: Map<String, Value>,
    timeout: Duration,
    resource_limits: ResourceLimits,
    runtime_image: String,
}

impl ExecutionRequestBuilder {
    /// Fix the request id instead of generating one.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.runtime_image = image.into();
        self
    }

    pub fn build(self) -> Result<ExecutionRequest, RequestError> {
        if self.timeout.is_zero() {
            return Err(RequestError::ZeroTimeout);
        }
        if self.runtime_image.trim().is_empty() {
            return Err(RequestError::EmptyImage);
        }
        self.resource_limits.check()?;

        Ok(ExecutionRequest {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            code: self.code,
            parameters: self.parameters,
            timeout: self.timeout,
            resource_limits: self.resource_limits,
            runtime_image: self.runtime_image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let request = ExecutionRequest::builder("print(1)", "python:3.12-slim")
            .parameter("window", 20)
            .build()
            .unwrap();
        assert_eq!(request.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(request.resource_limits().max_processes, 128);
        assert_eq!(request.parameters()["window"], 20);
        assert_eq!(request.id().get_version_num(), 4);
    }

    #[test]
    fn ids_are_unique() {
        let a = ExecutionRequest::builder("", "img").build().unwrap();
        let b = ExecutionRequest::builder("", "img").build().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn rejects_invalid_requests() {
        assert_eq!(
            ExecutionRequest::builder("", "img")
                .timeout(Duration::ZERO)
                .build()
                .unwrap_err(),
            RequestError::ZeroTimeout
        );
        assert_eq!(
            ExecutionRequest::builder("", " ").build().unwrap_err(),
            RequestError::EmptyImage
        );
        let limits = ResourceLimits {
            max_processes: 513,
            ..ResourceLimits::default()
        };
        assert!(matches!(
            ExecutionRequest::builder("", "img")
                .resource_limits(limits)
                .build(),
            Err(RequestError::Limit(_))
        ));
    }
}
