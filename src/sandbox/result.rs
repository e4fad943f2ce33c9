use serde::{Deserialize, Serialize};

use crate::protocol::Signal;
use crate::validator::Violation;

/// What a caller gets back for one request. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { signal: Signal },
    Rejected { violations: Vec<Violation> },
    Timeout,
    RuntimeFailure { message: String },
    SandboxUnavailable { reason: String },
}

impl ExecutionResult {
    pub fn status(&self) -> &'static str {
        match self {
            ExecutionResult::Success { .. } => "success",
            ExecutionResult::Rejected { .. } => "rejected",
            ExecutionResult::Timeout => "timeout",
            ExecutionResult::RuntimeFailure { .. } => "runtime_failure",
            ExecutionResult::SandboxUnavailable { .. } => "sandbox_unavailable",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        ExecutionResult::SandboxUnavailable {
            reason: reason.into(),
        }
    }
}
