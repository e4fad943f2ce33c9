//! Isolation policy enforcement.
//!
//! The enforcer gathers runtime facts under a probe timeout and hands them
//! to [`decide`], which either grants isolation or denies it. A grant is
//! the only way to obtain an [`IsolationGrant`], which the sandbox manager
//! requires. There is no branch that runs code without isolation.
//!
//! Each grant holds one of `max_live_instances` slots until it is dropped,
//! so the cap is exact for the instances one enforcer admits. Instances
//! started by other processes under the same owner are only seen through
//! the runtime's listing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use super::isolation::OWNER_LABEL;
use super::request::ExecutionRequest;
use super::runtime::{IsolationRuntime, RuntimeProbe, RuntimeVersion, SeccompProfile};

pub const DEFAULT_VERSION_FLOOR: RuntimeVersion = RuntimeVersion::new(25, 0, 2);
pub const DEFAULT_MAX_LIVE_INSTANCES: usize = 32;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyLimits {
    pub version_floor: RuntimeVersion,
    pub max_live_instances: usize,
    pub probe_timeout: Duration,
    pub seccomp: SeccompProfile,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            version_floor: DEFAULT_VERSION_FLOOR,
            max_live_instances: DEFAULT_MAX_LIVE_INSTANCES,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            seccomp: SeccompProfile::RuntimeDefault,
        }
    }
}

/// Observations the decision is made from. Errors are carried as text.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFacts {
    pub probe: Result<RuntimeProbe, String>,
    pub live_instances: Result<usize, String>,
    pub seccomp_profile: Result<(), String>,
}

/// Proof that isolation was checked for one request.
#[derive(Debug)]
pub struct IsolationGrant {
    request_id: Uuid,
    runtime_version: RuntimeVersion,
    slot: Option<OwnedSemaphorePermit>,
}

impl IsolationGrant {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn runtime_version(&self) -> RuntimeVersion {
        self.runtime_version
    }

    #[cfg(test)]
    pub(crate) fn for_tests(request_id: Uuid) -> Self {
        Self {
            request_id,
            runtime_version: DEFAULT_VERSION_FLOOR,
            slot: None,
        }
    }
}

#[derive(Debug)]
pub enum PolicyDecision {
    Proceed(IsolationGrant),
    Deny(String),
}

/// Pure policy decision.
pub fn decide(
    facts: &RuntimeFacts,
    limits: &PolicyLimits,
    request: &ExecutionRequest,
) -> PolicyDecision {
    let probe = match &facts.probe {
        Ok(probe) => probe,
        Err(e) => return PolicyDecision::Deny(format!("isolation runtime unreachable: {e}")),
    };

    let version: RuntimeVersion = match probe.version.parse() {
        Ok(v) => v,
        Err(e) => return PolicyDecision::Deny(format!("{e}")),
    };
    if version < limits.version_floor {
        return PolicyDecision::Deny(format!(
            "isolation runtime {} is below the required {}",
            version, limits.version_floor
        ));
    }

    if let Err(e) = &facts.seccomp_profile {
        return PolicyDecision::Deny(format!("seccomp profile unusable: {e}"));
    }

    match &facts.live_instances {
        Err(e) => {
            return PolicyDecision::Deny(format!("cannot count live instances: {e}"));
        }
        Ok(live) if *live >= limits.max_live_instances => {
            return PolicyDecision::Deny(format!(
                "{} live instances (maximum {})",
                live, limits.max_live_instances
            ));
        }
        Ok(_) => {}
    }

    let requested = request.resource_limits().memory_bytes;
    if let Some(host) = probe.mem_total_bytes
        && requested > host
    {
        return PolicyDecision::Deny(format!(
            "requested memory {requested} bytes exceeds host memory {host} bytes"
        ));
    }

    PolicyDecision::Proceed(IsolationGrant {
        request_id: request.id(),
        runtime_version: version,
        slot: None,
    })
}

pub struct PolicyEnforcer {
    runtime: Arc<dyn IsolationRuntime>,
    limits: PolicyLimits,
    owner: String,
    slots: Arc<Semaphore>,
}

impl PolicyEnforcer {
    pub fn new(runtime: Arc<dyn IsolationRuntime>, limits: PolicyLimits, owner: impl Into<String>) -> Self {
        let slots = Arc::new(Semaphore::new(
            limits.max_live_instances.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            runtime,
            limits,
            owner: owner.into(),
            slots,
        }
    }

    pub fn limits(&self) -> &PolicyLimits {
        &self.limits
    }

    /// Observe the runtime. Every call is bounded by the probe timeout.
    pub async fn gather(&self) -> RuntimeFacts {
        let bound = self.limits.probe_timeout;

        let probe = match tokio::time::timeout(bound, self.runtime.probe()).await {
            Ok(Ok(probe)) => Ok(probe),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {bound:?}")),
        };

        let live_instances = if probe.is_ok() {
            match tokio::time::timeout(bound, self.runtime.list_labeled(OWNER_LABEL, &self.owner))
                .await
            {
                Ok(Ok(instances)) => Ok(instances.len()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("instance listing timed out after {bound:?}")),
            }
        } else {
            Err("runtime not probed".to_string())
        };

        RuntimeFacts {
            probe,
            live_instances,
            seccomp_profile: check_seccomp(&self.limits.seccomp).await,
        }
    }

    /// Decide whether `request` may run under isolation right now. A
    /// granted request keeps its instance slot until the grant is dropped.
    pub async fn check(&self, request: &ExecutionRequest) -> PolicyDecision {
        let decision = match self.slots.clone().try_acquire_owned() {
            Ok(slot) => {
                let facts = self.gather().await;
                match decide(&facts, &self.limits, request) {
                    PolicyDecision::Proceed(grant) => PolicyDecision::Proceed(IsolationGrant {
                        slot: Some(slot),
                        ..grant
                    }),
                    deny => deny,
                }
            }
            Err(_) => PolicyDecision::Deny(format!(
                "all {} instance slots are in use",
                self.limits.max_live_instances
            )),
        };
        match &decision {
            PolicyDecision::Proceed(grant) => debug!(
                "Isolation granted for {} (runtime {})",
                request.id(),
                grant.runtime_version
            ),
            PolicyDecision::Deny(reason) => {
                warn!("Isolation denied for {}: {}", request.id(), reason)
            }
        }
        decision
    }
}

async fn check_seccomp(profile: &SeccompProfile) -> Result<(), String> {
    let SeccompProfile::File(path) = profile else {
        return Ok(());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(_) => Err(format!("{}: not a JSON object", path.display())),
        Err(e) => Err(format!("{}: {}", path.display(), e)),
    }
}
