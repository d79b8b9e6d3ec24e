// Core data model shared by every coordination component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::priority::Priority;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random id
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique task identifier
    TaskId
);
string_id!(
    /// Unique agent identifier
    AgentId
);
string_id!(
    /// Name of a mutually exclusive resource
    ResourceId
);
string_id!(MessageId);
string_id!(ConflictId);

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// Completed and Cancelled are always final. Failed is final once the
    /// scheduler has decided not to retry, which it does in the same step
    /// that records the failure, so observers only see terminal Failed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Assigned to an agent but not yet handed to the executor
    pub fn is_unstarted(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Assigned | TaskStatus::Retrying
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        };
        f.write_str(label)
    }
}

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
    Failed,
}

impl AgentStatus {
    /// Idle or Busy agents can be given work
    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A unit of work tracked by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub resource_requirements: BTreeSet<ResourceId>,
    pub assigned_agent: Option<AgentId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Times the task has been handed to an executor
    pub attempts: u32,
    pub timeout_ms: Option<u64>,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id.unwrap_or_else(TaskId::generate),
            task_type: spec.task_type,
            description: spec.description,
            priority: spec.priority,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            resource_requirements: spec.resource_requirements,
            assigned_agent: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            attempts: 0,
            timeout_ms: spec.timeout_ms,
            estimated_duration_ms: spec.estimated_duration_ms.unwrap_or(0),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            metadata: spec.metadata,
        }
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_duration_ms)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_reason(&mut self, key: &str, reason: impl Into<String>) {
        self.metadata
            .insert(key.to_string(), serde_json::Value::String(reason.into()));
        self.touch();
    }

    /// Metadata value as a string, if present
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.as_str())
    }
}

/// Request to create a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub resource_requirements: BTreeSet<ResourceId>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub estimated_duration_ms: Option<u64>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn requires_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn requires_resource(mut self, resource: impl Into<ResourceId>) -> Self {
        self.resource_requirements.insert(resource.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A worker entity registered with the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub priority: Priority,
    pub max_concurrent_tasks: usize,
    pub current_tasks: BTreeSet<TaskId>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_completed_type: Option<String>,
    /// Position in registration order, assigned by the scheduler
    #[serde(skip)]
    pub(crate) registration_seq: u64,
}

impl Agent {
    pub(crate) fn from_spec(spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id.unwrap_or_else(AgentId::generate),
            agent_type: spec.agent_type,
            capabilities: spec.capabilities,
            priority: spec.priority,
            max_concurrent_tasks: spec.max_concurrent_tasks.max(1),
            current_tasks: BTreeSet::new(),
            status: AgentStatus::Idle,
            registered_at: now,
            last_heartbeat: now,
            completed_tasks: 0,
            failed_tasks: 0,
            last_completed_type: None,
            registration_seq: 0,
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_tasks.len()
    }

    /// `current_load / max_concurrent_tasks`
    pub fn load_ratio(&self) -> f64 {
        self.current_tasks.len() as f64 / self.max_concurrent_tasks.max(1) as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.current_tasks.len() < self.max_concurrent_tasks
    }

    pub fn can_handle(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Request to register an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub id: Option<AgentId>,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub priority: Priority,
    pub max_concurrent_tasks: usize,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            id: None,
            agent_type: "general".to_string(),
            capabilities: BTreeSet::new(),
            priority: Priority::NORMAL,
            max_concurrent_tasks: 1,
        }
    }
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// What an executor hands back for a successful task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub summary: Option<String>,
    pub data: serde_json::Value,
}

impl TaskOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
