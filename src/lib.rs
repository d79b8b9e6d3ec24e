// Swarm Coordinator Library - multi-agent task coordination engine
// This exposes the core components for embedding and integration tests

pub mod clock;
pub mod priority;
pub mod types;
pub mod error;
pub mod events;
pub mod dependency_graph;
pub mod lifecycle;
pub mod resources;
pub mod messaging;
pub mod circuit_breaker;
pub mod conflict;
pub mod work_stealing;
pub mod scheduler;
pub mod coordinator;
pub mod store;
pub mod executor;
pub mod config;
pub mod telemetry;
pub mod observability;
pub mod shutdown;

// Re-export key types for easy access
pub use priority::Priority;
pub use types::{
    Agent, AgentId, AgentSpec, AgentStatus, ConflictId, MessageId, ResourceId, Task, TaskId,
    TaskOutput, TaskSpec, TaskStatus,
};
pub use error::{CoordinationError, Result};
pub use events::{CoordinationEvent, EventBus, EventEnvelope, EventReceiver};
pub use dependency_graph::{CriticalPath, DependencyGraph};
pub use resources::{DeadlockReport, Lease, ResourceManager, ResourceRequest};
pub use messaging::{Address, Mailbox, Message, MessageHandler, MessagingSystem, Recipient};
pub use circuit_breaker::{CircuitBreakerManager, CircuitState};
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolver, ResolutionStrategy, Vote};
pub use work_stealing::{StealProposal, WorkStealer};
pub use scheduler::{AssignmentStrategyKind, ClaimOutcome, RetryPolicy, Scheduler};
pub use coordinator::{CoordinationManager, CoordinationManagerBuilder, HealthReport, HealthStatus};
pub use store::{MemoryStore, StateStore};
pub use executor::{FnExecutor, ShellExecutor, TaskExecutor};
pub use config::CoordinationConfig;
pub use telemetry::{init_telemetry, shutdown_telemetry, generate_correlation_id, create_coordination_span};
pub use observability::{CoordinationMetrics, MetricsSnapshot, OperationTimer};
pub use shutdown::ShutdownCoordinator;
