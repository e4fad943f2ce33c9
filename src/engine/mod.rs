//! The execution pipeline: admit, validate, check policy, run.
//!
//! [`Engine::execute`] is the only public way to run code. It returns
//! exactly one [`ExecutionResult`] per request and raises an alert every
//! time it answers `SandboxUnavailable`.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::alert::AlertBus;
use crate::cleanup::CleanupLog;
use crate::concurrency::{PoolStats, WorkerPool};
use crate::config::Config;
use crate::sandbox::docker::DockerRuntime;
use crate::sandbox::policy::{PolicyDecision, PolicyEnforcer, RuntimeFacts};
use crate::sandbox::request::{ExecutionRequest, ExecutionRequestBuilder, ResourceLimits};
use crate::sandbox::result::ExecutionResult;
use crate::sandbox::runtime::IsolationRuntime;
use crate::sandbox::SandboxManager;
use crate::validator::{SecurityVerdict, Validator};

/// Values filled into requests built with [`Engine::request`].
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub image: String,
    pub timeout: Duration,
    pub max_timeout: Duration,
    pub limits: ResourceLimits,
}

pub struct Engine {
    validator: Validator,
    policy: PolicyEnforcer,
    manager: SandboxManager,
    pool: WorkerPool,
    alerts: Arc<AlertBus>,
    defaults: RequestDefaults,
}

impl Engine {
    /// Engine over the Docker runtime named in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let runtime = DockerRuntime::connect(
            config.runtime.endpoint.as_deref(),
            config.runtime.connect_timeout_secs,
        )?;
        Self::with_runtime(config, Arc::new(runtime))
    }

    /// Engine over any isolation runtime.
    pub fn with_runtime(config: &Config, runtime: Arc<dyn IsolationRuntime>) -> Result<Self> {
        config.validate()?;
        config.paths.ensure_dirs()?;

        let cleanup = CleanupLog::new(config.paths.cleanup_log());
        Ok(Self {
            validator: Validator::new(config.validator_settings()),
            policy: PolicyEnforcer::new(
                runtime.clone(),
                config.policy_limits()?,
                config.engine.owner.clone(),
            ),
            manager: SandboxManager::new(runtime, cleanup, config.manager_settings()?),
            pool: WorkerPool::new(config.engine.workers),
            alerts: Arc::new(AlertBus::default()),
            defaults: RequestDefaults {
                image: config.sandbox.image.clone(),
                timeout: config.default_timeout()?,
                max_timeout: config.max_timeout()?,
                limits: config.resource_limits(),
            },
        })
    }

    /// Request builder prefilled with the configured image, timeout and
    /// limits.
    pub fn request(&self, code: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequest::builder(code, self.defaults.image.clone())
            .timeout(self.defaults.timeout)
            .resource_limits(self.defaults.limits.clone())
    }

    pub fn validate(&self, code: &str) -> SecurityVerdict {
        self.validator.validate(code)
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let _admission = match self.pool.admit().await {
            Ok(admission) => admission,
            Err(e) => return self.unavailable(request, e.to_string()),
        };

        if request.timeout() > self.defaults.max_timeout {
            return ExecutionResult::RuntimeFailure {
                message: format!(
                    "requested timeout {:?} exceeds the maximum {:?}",
                    request.timeout(),
                    self.defaults.max_timeout
                ),
            };
        }

        let verdict = self.validator.validate(request.code());
        let Some(clearance) = verdict.clearance() else {
            info!(
                "Request {} rejected with {} violation(s)",
                request.id(),
                verdict.violations.len()
            );
            return ExecutionResult::Rejected {
                violations: verdict.violations,
            };
        };

        let grant = match self.policy.check(request).await {
            PolicyDecision::Proceed(grant) => grant,
            PolicyDecision::Deny(reason) => return self.unavailable(request, reason),
        };

        let result = self.manager.run(request, &clearance, &grant).await;
        if let ExecutionResult::SandboxUnavailable { reason } = &result {
            self.alerts.sandbox_unavailable(Some(request.id()), reason);
        }
        debug!("Request {} -> {}", request.id(), result.status());
        result
    }

    /// Execute a batch; results are in request order.
    pub async fn execute_all(&self, requests: &[ExecutionRequest]) -> Vec<ExecutionResult> {
        futures::future::join_all(requests.iter().map(|request| self.execute(request))).await
    }

    fn unavailable(&self, request: &ExecutionRequest, reason: String) -> ExecutionResult {
        self.alerts.sandbox_unavailable(Some(request.id()), &reason);
        ExecutionResult::SandboxUnavailable { reason }
    }

    /// Current runtime observations, as the policy enforcer sees them.
    pub async fn health(&self) -> RuntimeFacts {
        self.policy.gather().await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn alerts(&self) -> &Arc<AlertBus> {
        &self.alerts
    }

    pub fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }
}
