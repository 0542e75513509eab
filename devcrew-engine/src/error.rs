//! Error taxonomy for the orchestration engine.
//!
//! Failures are split by how the scheduler treats them: transient provider
//! errors are retried with backoff, permanent ones fail the task outright, and
//! queue errors describe races or bad graphs that never corrupt state.

use std::time::Duration;

use crate::ids::{AgentId, TaskId};
use crate::role::Role;

/// Configuration could not be loaded or is out of range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("temperature for {class} must be within 0.0..=1.0, got {value}")]
    Temperature { class: &'static str, value: f32 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A typed failure returned by the model provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider call timed out")]
    Timeout,

    #[error("provider rejected the request: {0}")]
    InvalidRequest(String),

    #[error("provider server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether the call may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout
            | ProviderError::ServerError { .. }
            | ProviderError::Transport(_) => true,
            ProviderError::InvalidRequest(_) => false,
        }
    }
}

/// Why a prerequisite was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyProblem {
    /// The prerequisite id is not in the queue.
    Unknown,
    /// The edge would close a cycle in the dependency graph.
    Cycle,
}

impl std::fmt::Display for DependencyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyProblem::Unknown => write!(f, "unknown prerequisite"),
            DependencyProblem::Cycle => write!(f, "dependency cycle"),
        }
    }
}

/// Why an agent's manager link was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyProblem {
    /// The manager id is not on the roster.
    UnknownManager,
    /// Following manager links leads back to the agent.
    Cycle,
}

impl std::fmt::Display for HierarchyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HierarchyProblem::UnknownManager => write!(f, "manager is not on the roster"),
            HierarchyProblem::Cycle => write!(f, "manager chain loops back"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is already queued")]
    DuplicateTask(TaskId),

    #[error("invalid dependency {task} -> {prerequisite}: {reason}")]
    InvalidDependency {
        task: TaskId,
        prerequisite: TaskId,
        reason: DependencyProblem,
    },

    #[error("task {task} was already claimed by agent {by}")]
    AlreadyClaimed { task: TaskId, by: AgentId },

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("task queue is closed")]
    Closed,
}

impl QueueError {
    /// True for the dependency errors that reject a cyclic graph.
    pub fn is_cycle(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidDependency {
                reason: DependencyProblem::Cycle,
                ..
            }
        )
    }
}

/// The outcome of a single failed dispatch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient provider failure: {0}")]
    Transient(ProviderError),

    #[error("permanent provider failure: {0}")]
    Permanent(ProviderError),

    #[error("no admission slot within {0:?}")]
    AdmissionTimeout(Duration),

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Transient(_) | DispatchError::AdmissionTimeout(_)
        )
    }
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            DispatchError::Transient(err)
        } else {
            DispatchError::Permanent(err)
        }
    }
}

/// Errors surfaced by the orchestrator's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no project is running")]
    NoProject,

    #[error("a project is already running")]
    ProjectRunning,

    #[error("roster has {size} agents, limit is {limit}")]
    RosterTooLarge { size: usize, limit: usize },

    #[error("roster must contain a manager")]
    NoManager,

    #[error("agent {agent}: {reason}")]
    InvalidHierarchy {
        agent: String,
        reason: HierarchyProblem,
    },

    #[error("no agent in the roster can serve role {0}")]
    UnservedRole(Role),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors_map_to_retryable_dispatch() {
        let err: DispatchError = ProviderError::Timeout.into();
        assert!(err.is_retryable());

        let err: DispatchError = ProviderError::ServerError {
            status: 503,
            body: String::new(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_request_is_permanent() {
        let err: DispatchError = ProviderError::InvalidRequest("bad".into()).into();
        assert!(matches!(err, DispatchError::Permanent(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn admission_timeout_is_retryable_validation_is_not() {
        assert!(DispatchError::AdmissionTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!DispatchError::Validation("empty".into()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
    }
}
