//! Isolated execution of validated scripts.
//!
//! - [`runtime`]: the `IsolationRuntime` trait and shared types
//! - [`docker`]: Docker Engine implementation (bollard)
//! - [`isolation`]: least-privilege instance spec
//! - [`policy`]: fail-closed "is isolation usable" decision
//! - [`manager`]: one execution from code directory to teardown

pub mod docker;
pub mod isolation;
pub mod manager;
pub mod materialize;
pub mod policy;
pub mod request;
pub mod result;
pub mod runtime;

pub use docker::DockerRuntime;
pub use isolation::{IsolationSettings, OWNER_LABEL};
pub use manager::{ManagerSettings, SandboxManager};
pub use policy::{IsolationGrant, PolicyDecision, PolicyEnforcer, PolicyLimits};
pub use request::{ExecutionRequest, ExecutionRequestBuilder, RequestError, ResourceLimits};
pub use result::ExecutionResult;
pub use runtime::{
    CapturedOutput, InstanceSpec, InstanceSummary, IsolationRuntime, RemoveOutcome, RuntimeError,
    RuntimeProbe, RuntimeVersion, SandboxHandle, SeccompProfile,
};
