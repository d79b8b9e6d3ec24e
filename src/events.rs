// Event Bus - fire-and-forget notification sink
//
// In-memory broadcast of engine events to any number of subscribers
// (CLI status output, logging, metrics). Slow subscribers lag and lose
// the oldest events; emission never blocks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitState;
use crate::conflict::{ConflictKind, ResolutionStrategy};
use crate::types::{AgentId, AgentStatus, ConflictId, ResourceId, TaskId, TaskStatus};

/// Everything the engine reports to the outside world
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    TaskCreated {
        task_id: TaskId,
        status: TaskStatus,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskRequeued {
        task_id: TaskId,
        reason: String,
    },
    TaskRetrying {
        task_id: TaskId,
        retry_count: u32,
        delay_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    TaskStolen {
        task_id: TaskId,
        from: AgentId,
        to: AgentId,
    },
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentDeregistered {
        agent_id: AgentId,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentOffline {
        agent_id: AgentId,
        reason: String,
    },
    ResourceAcquired {
        resource_id: ResourceId,
        agent_id: AgentId,
        waited_ms: u64,
    },
    ResourceReleased {
        resource_id: ResourceId,
        agent_id: AgentId,
    },
    HolderLost {
        resource_id: ResourceId,
        agent_id: AgentId,
        reason: String,
    },
    DeadlockDetected {
        cycle: Vec<AgentId>,
        resources: Vec<ResourceId>,
        victim: AgentId,
    },
    CircuitStateChanged {
        key: String,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitOpened {
        key: String,
        failure_count: u32,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        kind: ConflictKind,
        entity_id: String,
        strategy: ResolutionStrategy,
        winner: AgentId,
    },
    ConflictUnresolved {
        conflict_id: ConflictId,
        entity_id: String,
        retained_by: Option<AgentId>,
        reason: String,
    },
    MessageExpired {
        correlation_id: String,
        to: String,
    },
}

impl CoordinationEvent {
    /// Snake-case event name, as serialized in the `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationEvent::TaskCreated { .. } => "task_created",
            CoordinationEvent::TaskStatusChanged { .. } => "task_status_changed",
            CoordinationEvent::TaskAssigned { .. } => "task_assigned",
            CoordinationEvent::TaskStarted { .. } => "task_started",
            CoordinationEvent::TaskCompleted { .. } => "task_completed",
            CoordinationEvent::TaskRequeued { .. } => "task_requeued",
            CoordinationEvent::TaskRetrying { .. } => "task_retrying",
            CoordinationEvent::TaskFailed { .. } => "task_failed",
            CoordinationEvent::TaskCancelled { .. } => "task_cancelled",
            CoordinationEvent::TaskStolen { .. } => "task_stolen",
            CoordinationEvent::AgentRegistered { .. } => "agent_registered",
            CoordinationEvent::AgentDeregistered { .. } => "agent_deregistered",
            CoordinationEvent::AgentStatusChanged { .. } => "agent_status_changed",
            CoordinationEvent::AgentOffline { .. } => "agent_offline",
            CoordinationEvent::ResourceAcquired { .. } => "resource_acquired",
            CoordinationEvent::ResourceReleased { .. } => "resource_released",
            CoordinationEvent::HolderLost { .. } => "holder_lost",
            CoordinationEvent::DeadlockDetected { .. } => "deadlock_detected",
            CoordinationEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            CoordinationEvent::CircuitOpened { .. } => "circuit_opened",
            CoordinationEvent::ConflictResolved { .. } => "conflict_resolved",
            CoordinationEvent::ConflictUnresolved { .. } => "conflict_unresolved",
            CoordinationEvent::MessageExpired { .. } => "message_expired",
        }
    }
}

/// An event stamped with emission order and wall-clock time
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoordinationEvent,
}

/// Broadcast bus for coordination events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EventEnvelope>>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Capacity is how many events a subscriber may fall behind before
    /// the oldest ones are dropped for it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: CoordinationEvent) {
        debug!(event = event.name(), "Emitting coordination event: {:?}", event);

        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            emitted_at: Utc::now(),
            event,
        };

        // No subscribers is fine
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged behind by {0} events")]
    Lagged(u64),
    #[error("no event available")]
    Empty,
}

/// Subscription handle returned by [`EventBus::subscribe`]
pub struct EventReceiver {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<EventEnvelope, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<EventEnvelope, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Everything currently buffered, skipping over lag gaps
    pub fn drain(&mut self) -> Vec<CoordinationEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(envelope) => events.push(envelope.event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}
