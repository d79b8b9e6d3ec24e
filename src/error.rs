use thiserror::Error;

use crate::types::{AgentId, ResourceId, TaskId};

/// Errors surfaced by the coordination engine.
///
/// The first group is the user-facing taxonomy: failures local to one
/// task, agent or resource that the scheduler turns into state
/// transitions. The lookup/validation group rejects bad API input.
/// `Internal` marks a broken engine invariant and is always logged at
/// error level where it is raised.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("dependency cycle detected while adding {task_id}: {}", format_chain(.cycle))]
    CycleDetected { task_id: TaskId, cycle: Vec<TaskId> },

    #[error("task {task_id} still has unfinished dependents: {}", format_chain(.dependents))]
    TaskHasDependents {
        task_id: TaskId,
        dependents: Vec<TaskId>,
    },

    #[error("timed out after {waited_ms}ms waiting for resource {resource_id} (agent {agent_id})")]
    ResourceTimeout {
        resource_id: ResourceId,
        agent_id: AgentId,
        waited_ms: u64,
    },

    #[error("deadlock detected: request by {agent_id} for {resource_id} aborted (cycle: {})", format_chain(.cycle))]
    DeadlockDetected {
        resource_id: ResourceId,
        agent_id: AgentId,
        cycle: Vec<AgentId>,
    },

    #[error("holder {agent_id} of resource {resource_id} was lost")]
    HolderLost {
        resource_id: ResourceId,
        agent_id: AgentId,
    },

    #[error("agent {agent_id} does not hold resource {resource_id} (holder: {})", .holder.as_ref().map(|h| h.as_str()).unwrap_or("none"))]
    NotHolder {
        resource_id: ResourceId,
        agent_id: AgentId,
        holder: Option<AgentId>,
    },

    #[error("request {correlation_id} timed out waiting for a response")]
    MessageTimeout { correlation_id: String },

    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("task {task_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },

    #[error("conflict over {entity_id} unresolved: {reason}")]
    ConflictUnresolved { entity_id: String, reason: String },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("task {task_id} depends on unknown task {dependency}")]
    DependencyNotFound { task_id: TaskId, dependency: TaskId },

    #[error("task {task_id} depends on {dependency}, which will never complete")]
    DependencyFailed { task_id: TaskId, dependency: TaskId },

    #[error("invalid transition for task {task_id}: {event} while {status}")]
    InvalidTransition {
        task_id: TaskId,
        status: String,
        event: String,
    },

    #[error("response references unknown correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: String },

    #[error("recipient {0} is not reachable")]
    RecipientUnavailable(String),

    #[error("agent {agent_id} cannot take task {task_id}: {reason}")]
    AgentIneligible {
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("coordination engine is shutting down")]
    ShuttingDown,

    #[error("internal coordination error: {0}")]
    Internal(String),
}

impl CoordinationError {
    /// True for failures that are expected to clear on their own
    /// (contention, timeouts, open circuits).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::ResourceTimeout { .. }
                | CoordinationError::DeadlockDetected { .. }
                | CoordinationError::HolderLost { .. }
                | CoordinationError::MessageTimeout { .. }
                | CoordinationError::CircuitOpen { .. }
        )
    }

    /// Stable short name, used as the `reason` recorded in task metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinationError::CycleDetected { .. } => "cycle_detected",
            CoordinationError::TaskHasDependents { .. } => "task_has_dependents",
            CoordinationError::ResourceTimeout { .. } => "resource_timeout",
            CoordinationError::DeadlockDetected { .. } => "deadlock_detected",
            CoordinationError::HolderLost { .. } => "holder_lost",
            CoordinationError::NotHolder { .. } => "not_holder",
            CoordinationError::MessageTimeout { .. } => "message_timeout",
            CoordinationError::CircuitOpen { .. } => "circuit_open",
            CoordinationError::RetriesExhausted { .. } => "retries_exhausted",
            CoordinationError::ConflictUnresolved { .. } => "conflict_unresolved",
            CoordinationError::TaskNotFound(_) => "task_not_found",
            CoordinationError::AgentNotFound(_) => "agent_not_found",
            CoordinationError::DuplicateTask(_) => "duplicate_task",
            CoordinationError::DuplicateAgent(_) => "duplicate_agent",
            CoordinationError::DependencyNotFound { .. } => "dependency_not_found",
            CoordinationError::DependencyFailed { .. } => "dependency_failed",
            CoordinationError::InvalidTransition { .. } => "invalid_transition",
            CoordinationError::UnknownCorrelation { .. } => "unknown_correlation",
            CoordinationError::RecipientUnavailable(_) => "recipient_unavailable",
            CoordinationError::AgentIneligible { .. } => "agent_ineligible",
            CoordinationError::InvalidRequest(_) => "invalid_request",
            CoordinationError::ShuttingDown => "shutting_down",
            CoordinationError::Internal(_) => "internal",
        }
    }

    /// Build an `Internal` error and log it loudly.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "coordination invariant violated");
        CoordinationError::Internal(message)
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

fn format_chain<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
