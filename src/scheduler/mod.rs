//! Task Scheduler
//!
//! Owns the task index, the dependency graph, the priority queue and the
//! agent index behind one async mutex. Assignment happens under that lock;
//! everything that can suspend (resource acquisition, execution, votes)
//! runs in spawned jobs that report back by re-taking the lock. Readiness
//! notifications and retry timers come in through a bounded command
//! channel consumed by [`Scheduler::run`].
//!
//! Every assignment gets a fresh epoch. A dispatch job whose epoch no
//! longer matches (the task was stolen, cancelled or its agent removed)
//! has its result discarded.

pub mod assignment;
pub mod retry;

pub use assignment::{strategy_for, AssignmentStrategy, AssignmentStrategyKind};
pub use retry::RetryPolicy;

use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::circuit_breaker::{agent_key, resource_key, CircuitBreakerManager};
use crate::clock::deadline_after;
use crate::config::{ConflictsConfig, CoordinationConfig, SchedulerConfig};
use crate::conflict::{
    Claimant, ConflictClaim, ConflictKind, ConflictRecord, ConflictResolver, ResolutionStrategy,
    Vote,
};
use crate::dependency_graph::{CriticalPath, DependencyGraph};
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus, EventBusError};
use crate::executor::TaskExecutor;
use crate::lifecycle::{Lifecycle, LifecycleEvent};
use crate::messaging::{Address, Mailbox, MessagingSystem, Recipient};
use crate::observability::CoordinationMetrics;
use crate::priority::Priority;
use crate::resources::{Lease, ResourceManager, ResourceRequest};
use crate::telemetry::create_coordination_span;
use crate::types::{Agent, AgentId, AgentSpec, AgentStatus, Task, TaskId, TaskSpec, TaskStatus};
use crate::work_stealing::{AgentLoad, LoadSnapshot, StealCandidate, StealProposal, WorkStealer};

/// Metadata keys recording why a task changed state
pub const FAILURE_REASON: &str = "failure_reason";
pub const CANCEL_REASON: &str = "cancel_reason";
pub const REQUEUE_REASON: &str = "requeue_reason";
pub const LAST_ACQUIRE_ERROR: &str = "last_acquire_error";

/// Topic of the ballot sent to agents for ownership conflicts
pub const VOTE_TOPIC: &str = "conflict.vote";
/// Topic used to tell an agent it lost a conflict
pub const CONFLICT_LOST_TOPIC: &str = "conflict.lost";

#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    /// All dependencies of the task completed
    TaskReady(TaskId),
    /// Backoff for a retrying task elapsed
    RetryDue(TaskId),
    /// Run an assignment pass
    Kick,
}

/// Highest priority first, then enqueue order
type QueueKey = (Reverse<Priority>, u64, TaskId);

struct TaskEntry {
    task: Task,
    lifecycle: Lifecycle,
    queue_key: Option<QueueKey>,
    /// Bumped on every assignment
    epoch: u64,
    assigned_seq: u64,
    dispatch: Option<AbortHandle>,
    retry_timer: Option<AbortHandle>,
    acquire_failures: u32,
    finished_at: Option<Instant>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        let lifecycle = Lifecycle::new(task.id.clone());
        Self {
            task,
            lifecycle,
            queue_key: None,
            epoch: 0,
            assigned_seq: 0,
            dispatch: None,
            retry_timer: None,
            acquire_failures: 0,
            finished_at: None,
        }
    }

    fn transition(&mut self, event: LifecycleEvent, events: &EventBus) -> Result<TaskStatus> {
        let (from, to) = self.lifecycle.apply(event)?;
        self.task.status = to;
        self.task.touch();
        if to.is_terminal() {
            self.finished_at = Some(Instant::now());
            self.task.completed_at = Some(chrono::Utc::now());
        }
        events.emit(CoordinationEvent::TaskStatusChanged {
            task_id: self.task.id.clone(),
            from,
            to,
        });
        Ok(to)
    }

    fn stop_jobs(&mut self) {
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_timer.take() {
            handle.abort();
        }
    }
}

struct AgentEntry {
    agent: Agent,
    seq: u64,
    executor: Arc<dyn TaskExecutor>,
    last_seen: Instant,
}

impl AgentEntry {
    fn eligible_for(&self, task: &Task, blocked: &HashSet<String>) -> bool {
        self.agent.status.is_active()
            && self.agent.has_capacity()
            && self.agent.can_handle(&task.required_capabilities)
            && !blocked.contains(&agent_key(&self.agent.id))
    }
}

struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    graph: DependencyGraph,
    queue: BTreeSet<QueueKey>,
    agents: HashMap<AgentId, AgentEntry>,
    archive: VecDeque<Task>,
    strategy: Box<dyn AssignmentStrategy>,
    next_seq: u64,
}

impl SchedulerState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn entry_mut(&mut self, id: &TaskId) -> Result<&mut TaskEntry> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))
    }

    fn agents_in_order(&self) -> Vec<&AgentEntry> {
        let mut agents: Vec<&AgentEntry> = self.agents.values().collect();
        agents.sort_by_key(|entry| entry.seq);
        agents
    }

    /// Drop `task_id` from its agent's current set and refresh the agent's
    /// Idle/Busy status
    fn detach_from_agent(&mut self, task_id: &TaskId, agent_id: &AgentId, events: &EventBus) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            entry.agent.current_tasks.remove(task_id);
            refresh_agent_status(&mut entry.agent, events);
        }
    }
}

fn refresh_agent_status(agent: &mut Agent, events: &EventBus) {
    if !agent.status.is_active() {
        return;
    }
    let next = if agent.current_tasks.is_empty() {
        AgentStatus::Idle
    } else {
        AgentStatus::Busy
    };
    if next != agent.status {
        events.emit(CoordinationEvent::AgentStatusChanged {
            agent_id: agent.id.clone(),
            from: agent.status,
            to: next,
        });
        agent.status = next;
    }
}

/// Result of [`Scheduler::claim_task`]
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The task was unowned and is now assigned to the claimant
    Granted,
    /// The claimant already owned the task
    AlreadyOwned,
    /// Ownership conflict; the record names the winner
    Contested(ConflictRecord),
}

/// Counts used by health reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub queue_depth: usize,
    pub pending_tasks: usize,
    pub assigned_tasks: usize,
    pub running_tasks: usize,
    pub retrying_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub archived_tasks: usize,
    pub total_agents: usize,
    pub healthy_agents: usize,
}

impl SchedulerStats {
    /// Tasks that are not terminal yet
    pub fn outstanding(&self) -> usize {
        self.pending_tasks
            + self.queue_depth
            + self.assigned_tasks
            + self.running_tasks
            + self.retrying_tasks
    }
}

/// Shared collaborators handed to the scheduler by the coordinator
#[derive(Clone)]
pub struct SchedulerContext {
    pub events: EventBus,
    pub resources: ResourceManager,
    pub messaging: MessagingSystem,
    pub breakers: Arc<CircuitBreakerManager>,
    pub conflicts: Arc<ConflictResolver>,
    pub metrics: Arc<CoordinationMetrics>,
}

struct Inner {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    conflicts_config: ConflictsConfig,
    acquire_timeout: Duration,
    retry: RetryPolicy,
    stealer: WorkStealer,
    ctx: SchedulerContext,
    commands: mpsc::Sender<SchedulerCommand>,
    command_rx: parking_lot::Mutex<Option<mpsc::Receiver<SchedulerCommand>>>,
}

/// Cheap to clone; clones share one scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Everything a dispatch job needs, captured at assignment time
struct DispatchJob {
    task: Task,
    agent_id: AgentId,
    epoch: u64,
    executor: Arc<dyn TaskExecutor>,
}

/// Leases held by a dispatch job; released when dropped
struct HeldLeases {
    resources: ResourceManager,
    leases: Vec<Lease>,
}

impl Drop for HeldLeases {
    fn drop(&mut self) {
        for lease in self.leases.drain(..) {
            if let Err(err) = self.resources.release_lease(&lease) {
                // Force-released already (stale holder cleanup)
                debug!(resource_id = %lease.resource_id, error = %err, "Lease already gone");
            }
        }
    }
}

/// A breaker permit; hands back the probe slot if dropped without an outcome
struct BreakerPermit {
    breakers: Arc<CircuitBreakerManager>,
    key: String,
    settled: bool,
}

impl BreakerPermit {
    fn settle(mut self, success: bool) {
        if success {
            self.breakers.record_success(&self.key);
        } else {
            self.breakers.record_failure(&self.key);
        }
        self.settled = true;
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.abandon(&self.key);
        }
    }
}

impl Scheduler {
    pub fn new(config: &CoordinationConfig, ctx: SchedulerContext) -> Self {
        let (commands, command_rx) = mpsc::channel(config.scheduler.command_buffer.max(1));
        let state = SchedulerState {
            tasks: HashMap::new(),
            graph: DependencyGraph::new(),
            queue: BTreeSet::new(),
            agents: HashMap::new(),
            archive: VecDeque::new(),
            strategy: strategy_for(config.scheduler.assignment_strategy),
            next_seq: 0,
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                config: config.scheduler.clone(),
                conflicts_config: config.conflicts.clone(),
                acquire_timeout: config.resources.acquire_timeout(),
                retry: RetryPolicy::from_config(&config.scheduler),
                stealer: WorkStealer::new(config.work_stealing.clone()),
                ctx,
                commands,
                command_rx: parking_lot::Mutex::new(Some(command_rx)),
            }),
        }
    }

    /// Consume scheduler commands until `shutdown` flips to true. Only the
    /// first caller gets the command channel.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut commands) = self.inner.command_rx.lock().take() else {
            warn!("Scheduler loop already running");
            return;
        };
        info!(strategy = %self.inner.config.assignment_strategy, "Scheduler loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
            }
        }

        info!("Scheduler loop stopped");
    }

    async fn handle_command(&self, command: SchedulerCommand) {
        debug!(?command, "Scheduler command");
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;

        match command {
            SchedulerCommand::TaskReady(id) => {
                let pending = state
                    .tasks
                    .get(&id)
                    .is_some_and(|entry| entry.task.status == TaskStatus::Pending);
                if pending && state.graph.is_satisfied(&id) {
                    if let Err(err) = self.enqueue_locked(&mut state, &id) {
                        warn!(task_id = %id, error = %err, "Could not enqueue ready task");
                    }
                }
            }
            SchedulerCommand::RetryDue(id) => {
                if let Some(entry) = state.tasks.get_mut(&id) {
                    entry.retry_timer = None;
                }
                let retrying = state
                    .tasks
                    .get(&id)
                    .is_some_and(|entry| entry.task.status == TaskStatus::Retrying);
                if retrying {
                    if let Err(err) = self.enqueue_locked(&mut state, &id) {
                        warn!(task_id = %id, error = %err, "Could not requeue retrying task");
                    }
                }
            }
            SchedulerCommand::Kick => {}
        }

        self.schedule_locked(&mut state, &blocked);
    }

    fn kick(&self) {
        // A full channel means the loop has work queued and will schedule anyway
        let _ = self.inner.commands.try_send(SchedulerCommand::Kick);
    }

    /// Run one assignment pass over the queue
    pub async fn schedule_once(&self) {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        self.schedule_locked(&mut state, &blocked);
    }

    // ---- tasks ----

    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;

        let task = Task::from_spec(spec, self.inner.config.default_max_retries);
        let id = task.id.clone();
        if state.tasks.contains_key(&id) || state.archive.iter().any(|t| t.id == id) {
            return Err(CoordinationError::DuplicateTask(id));
        }

        let ready = state
            .graph
            .add_task(&id, &task.dependencies, task.estimated_duration())?;

        info!(
            task_id = %id,
            task_type = %task.task_type,
            priority = %task.priority,
            dependencies = task.dependencies.len(),
            "Task created"
        );
        state.tasks.insert(id.clone(), TaskEntry::new(task));
        self.inner.ctx.metrics.record_created();
        self.inner.ctx.events.emit(CoordinationEvent::TaskCreated {
            task_id: id.clone(),
            status: TaskStatus::Pending,
        });

        if ready {
            self.enqueue_locked(&mut state, &id)?;
            self.schedule_locked(&mut state, &blocked);
        }
        Ok(id)
    }

    /// Cancel a non-terminal task. Waiting dependents are cancelled too.
    pub async fn cancel_task(&self, id: &TaskId, reason: &str) -> Result<()> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        self.cancel_locked(&mut state, id, reason)?;
        self.schedule_locked(&mut state, &blocked);
        Ok(())
    }

    /// Remove a task. Rejected with `TaskHasDependents` while unfinished
    /// tasks still depend on it; a non-terminal task is cancelled first.
    pub async fn remove_task(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.inner.state.lock().await;
        let status = state.entry_mut(id)?.task.status;

        let waiting: Vec<TaskId> = state
            .graph
            .dependents_of(id)
            .into_iter()
            .filter(|dep| {
                state
                    .tasks
                    .get(dep)
                    .is_some_and(|entry| !entry.task.status.is_terminal())
            })
            .collect();
        if !waiting.is_empty() {
            return Err(CoordinationError::TaskHasDependents {
                task_id: id.clone(),
                dependents: waiting,
            });
        }

        if !status.is_terminal() {
            self.cancel_locked(&mut state, id, "task removed")?;
        }
        state.graph.remove_task(id)?;
        let entry = state
            .tasks
            .remove(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))?;
        info!(task_id = %id, "Task removed");
        Ok(entry.task)
    }

    /// Add a dependency edge to a task that has not been assigned yet
    pub async fn add_dependency(&self, task_id: &TaskId, dependency: &TaskId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let status = state.entry_mut(task_id)?.task.status;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Queued) {
            return Err(CoordinationError::InvalidRequest(format!(
                "cannot add a dependency to {status} task {task_id}"
            )));
        }

        state.graph.add_dependency(task_id, dependency)?;
        let satisfied = state.graph.is_satisfied(task_id);

        let SchedulerState { tasks, queue, .. } = &mut *state;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinationError::TaskNotFound(task_id.clone()))?;
        entry.task.dependencies.insert(dependency.clone());
        entry.task.touch();

        if status == TaskStatus::Queued && !satisfied {
            if let Some(key) = entry.queue_key.take() {
                queue.remove(&key);
            }
            entry.transition(LifecycleEvent::Block, &self.inner.ctx.events)?;
            debug!(task_id = %task_id, dependency = %dependency, "Queued task blocked by new dependency");
        }
        Ok(())
    }

    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .get(id)
            .map(|entry| entry.task.clone())
            .or_else(|| state.archive.iter().find(|task| &task.id == id).cloned())
    }

    pub async fn get_task_status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.get_task(id)
            .await
            .map(|task| task.status)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))
    }

    /// Live tasks ordered by creation time
    pub async fn list_tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().map(|entry| entry.task.clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Tasks modified after `since`, for checkpointing
    pub async fn tasks_updated_since(&self, since: chrono::DateTime<chrono::Utc>) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .values()
            .filter(|entry| entry.task.updated_at > since)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub async fn topological_order(&self) -> Vec<TaskId> {
        self.inner.state.lock().await.graph.topological_order()
    }

    pub async fn critical_path(&self) -> CriticalPath {
        self.inner.state.lock().await.graph.critical_path()
    }

    /// Wait until the task is terminal. Returns the task's current snapshot
    /// if `timeout` elapses first.
    pub async fn wait_for_task(&self, id: &TaskId, timeout: Duration) -> Result<Task> {
        let mut events = self.inner.ctx.events.subscribe();
        let deadline = deadline_after(timeout);

        loop {
            let task = self
                .get_task(id)
                .await
                .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))?;
            if task.status.is_terminal() {
                return Ok(task);
            }

            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => {
                        return self
                            .get_task(id)
                            .await
                            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()));
                    }
                    Ok(Err(EventBusError::Closed)) => return Err(CoordinationError::ShuttingDown),
                    Ok(Err(_)) => break,
                    Ok(Ok(envelope)) => match &envelope.event {
                        CoordinationEvent::TaskCompleted { task_id, .. }
                        | CoordinationEvent::TaskFailed { task_id, .. }
                        | CoordinationEvent::TaskCancelled { task_id, .. }
                            if task_id == id =>
                        {
                            break
                        }
                        _ => {}
                    },
                }
            }
        }
    }

    // ---- agents ----

    /// Register an agent with the executor that runs its tasks. The
    /// returned mailbox receives messages addressed to the agent.
    pub async fn register_agent(
        &self,
        spec: AgentSpec,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Mailbox> {
        let mut agent = Agent::from_spec(spec);
        let agent_id = agent.id.clone();

        // Reserve the id first; a duplicate must not replace the live mailbox
        let seq = {
            let mut state = self.inner.state.lock().await;
            if state.agents.contains_key(&agent_id) {
                return Err(CoordinationError::DuplicateAgent(agent_id));
            }
            let seq = state.next_seq();
            agent.registration_seq = seq;
            info!(
                agent_id = %agent.id,
                agent_type = %agent.agent_type,
                capabilities = ?agent.capabilities,
                max_concurrent_tasks = agent.max_concurrent_tasks,
                "Agent registered"
            );
            state.agents.insert(
                agent_id.clone(),
                AgentEntry {
                    agent,
                    seq,
                    executor,
                    last_seen: Instant::now(),
                },
            );
            seq
        };

        let mailbox = self.inner.ctx.messaging.register_agent(&agent_id);

        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        match state.agents.get(&agent_id).map(|entry| entry.seq) {
            Some(current) if current == seq => {}
            Some(_) => return Err(CoordinationError::AgentNotFound(agent_id)),
            None => {
                // Deregistered before the mailbox existed
                drop(state);
                self.inner.ctx.messaging.unregister_agent(&agent_id);
                return Err(CoordinationError::AgentNotFound(agent_id));
            }
        }
        self.inner.ctx.events.emit(CoordinationEvent::AgentRegistered {
            agent_id: agent_id.clone(),
        });
        self.schedule_locked(&mut state, &blocked);
        Ok(mailbox)
    }

    /// Remove an agent: unstarted tasks go back to the queue, running ones
    /// count as failed attempts, held resources are force-released.
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let agent = {
            let mut state = self.inner.state.lock().await;
            if !state.agents.contains_key(agent_id) {
                return Err(CoordinationError::AgentNotFound(agent_id.clone()));
            }
            self.evict_agent_tasks_locked(&mut state, agent_id, "agent deregistered");
            let entry = state
                .agents
                .remove(agent_id)
                .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))?;
            self.schedule_locked(&mut state, &blocked);
            entry.agent
        };

        self.inner
            .ctx
            .resources
            .release_all(agent_id, "agent deregistered");
        self.inner.ctx.messaging.unregister_agent(agent_id);
        self.inner.ctx.breakers.remove(&agent_key(agent_id));

        info!(agent_id = %agent_id, "Agent deregistered");
        self.inner.ctx.events.emit(CoordinationEvent::AgentDeregistered {
            agent_id: agent_id.clone(),
        });
        Ok(agent)
    }

    /// Record a heartbeat. An Offline agent comes back online.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        let entry = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))?;
        entry.last_seen = Instant::now();
        entry.agent.last_heartbeat = chrono::Utc::now();

        if entry.agent.status == AgentStatus::Offline {
            info!(agent_id = %agent_id, "Agent back online");
            self.inner.ctx.events.emit(CoordinationEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: AgentStatus::Offline,
                to: AgentStatus::Idle,
            });
            entry.agent.status = AgentStatus::Idle;
            refresh_agent_status(&mut entry.agent, &self.inner.ctx.events);
            self.schedule_locked(&mut state, &blocked);
        }
        Ok(())
    }

    /// Set an agent's status. Offline and Failed evict its tasks and
    /// force-release its resources.
    pub async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let went_down = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))?;
            let from = entry.agent.status;
            if from == status {
                return Ok(());
            }

            if status.is_active() {
                entry.agent.status = status;
                entry.last_seen = Instant::now();
                self.inner.ctx.events.emit(CoordinationEvent::AgentStatusChanged {
                    agent_id: agent_id.clone(),
                    from,
                    to: status,
                });
                refresh_agent_status(&mut entry.agent, &self.inner.ctx.events);
                self.schedule_locked(&mut state, &blocked);
                false
            } else {
                self.take_agent_down_locked(&mut state, agent_id, status, &format!("agent marked {status}"));
                self.schedule_locked(&mut state, &blocked);
                true
            }
        };

        if went_down {
            self.inner
                .ctx
                .resources
                .release_all(agent_id, &format!("agent marked {status}"));
        }
        Ok(())
    }

    /// Mark active agents that have not sent a heartbeat within `ttl` as
    /// Offline. Returns the agents taken down.
    pub async fn expire_heartbeats(&self, ttl: Duration) -> Vec<AgentId> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let now = Instant::now();
        let expired: Vec<AgentId> = {
            let mut state = self.inner.state.lock().await;
            let stale: Vec<AgentId> = state
                .agents_in_order()
                .into_iter()
                .filter(|entry| {
                    entry.agent.status.is_active() && now.duration_since(entry.last_seen) > ttl
                })
                .map(|entry| entry.agent.id.clone())
                .collect();
            for agent_id in &stale {
                self.take_agent_down_locked(
                    &mut state,
                    agent_id,
                    AgentStatus::Offline,
                    "heartbeat timeout",
                );
            }
            if !stale.is_empty() {
                self.schedule_locked(&mut state, &blocked);
            }
            stale
        };

        for agent_id in &expired {
            self.inner
                .ctx
                .resources
                .release_all(agent_id, "heartbeat timeout");
        }
        expired
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        let state = self.inner.state.lock().await;
        state.agents.get(agent_id).map(|entry| entry.agent.clone())
    }

    pub async fn get_agent_status(&self, agent_id: &AgentId) -> Result<AgentStatus> {
        self.get_agent(agent_id)
            .await
            .map(|agent| agent.status)
            .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))
    }

    /// Agents in registration order
    pub async fn list_agents(&self) -> Vec<Agent> {
        let state = self.inner.state.lock().await;
        state
            .agents_in_order()
            .into_iter()
            .map(|entry| entry.agent.clone())
            .collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        let mut stats = SchedulerStats {
            total_tasks: state.tasks.len(),
            queue_depth: state.queue.len(),
            archived_tasks: state.archive.len(),
            total_agents: state.agents.len(),
            healthy_agents: state
                .agents
                .values()
                .filter(|entry| entry.agent.status.is_active())
                .count(),
            ..Default::default()
        };
        for entry in state.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Queued => {}
                TaskStatus::Assigned => stats.assigned_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Retrying => stats.retrying_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Cancelled => stats.cancelled_tasks += 1,
            }
        }
        stats
    }

    // ---- ownership conflicts ----

    /// An agent asks to own a task. Queued tasks are assigned directly;
    /// a task another agent owns but has not started becomes an ownership
    /// conflict settled with the configured strategy.
    pub async fn claim_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<ClaimOutcome> {
        let strategy = self.inner.conflicts_config.strategy;
        let blocked = self.inner.ctx.breakers.rejecting_keys();

        let (claim, epoch, voters) = {
            let mut state = self.inner.state.lock().await;
            let (status, owner, epoch, owner_seq) = {
                let entry = state
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| CoordinationError::TaskNotFound(task_id.clone()))?;
                let agent = state
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))?;
                self.check_claimant(agent, &entry.task)?;
                (
                    entry.task.status,
                    entry.task.assigned_agent.clone(),
                    entry.epoch,
                    entry.assigned_seq,
                )
            };

            match (status, owner) {
                (TaskStatus::Queued, _) => {
                    let has_capacity = state
                        .agents
                        .get(agent_id)
                        .is_some_and(|entry| entry.agent.has_capacity());
                    if !has_capacity {
                        return Err(self.ineligible(agent_id, task_id, "agent is at capacity"));
                    }
                    self.assign_locked(&mut state, task_id, agent_id)?;
                    self.schedule_locked(&mut state, &blocked);
                    return Ok(ClaimOutcome::Granted);
                }
                (TaskStatus::Assigned, Some(owner)) if &owner == agent_id => {
                    return Ok(ClaimOutcome::AlreadyOwned);
                }
                (TaskStatus::Assigned, Some(owner)) => {
                    let claim = self.ownership_claim(&mut state, task_id, &owner, owner_seq, agent_id);
                    let voters: Vec<AgentId> = state
                        .agents_in_order()
                        .into_iter()
                        .filter(|entry| entry.agent.status.is_active())
                        .map(|entry| entry.agent.id.clone())
                        .collect();
                    (claim, epoch, voters)
                }
                (status, _) => {
                    return Err(self.ineligible(
                        agent_id,
                        task_id,
                        &format!("task is {status}"),
                    ));
                }
            }
        };

        let votes = if strategy == ResolutionStrategy::Voting {
            self.collect_votes(&claim, &voters).await
        } else {
            Vec::new()
        };

        let changed_hands = || CoordinationError::ConflictUnresolved {
            entity_id: claim.entity_id.clone(),
            reason: "task changed hands while the claim was settled".to_string(),
        };
        if !self.claim_unchanged(task_id, epoch).await {
            return Err(changed_hands());
        }
        let record = self
            .inner
            .ctx
            .conflicts
            .settle(&claim, strategy, &votes, voters.len());

        let record = {
            let mut state = self.inner.state.lock().await;
            let unchanged = state.tasks.get(task_id).is_some_and(|entry| {
                entry.epoch == epoch && entry.task.status == TaskStatus::Assigned
            });
            if !unchanged {
                warn!(task_id = %task_id, conflict_id = %record.id, "Task changed hands after the claim was settled");
                return Err(changed_hands());
            }

            if record.resolved_winner.as_ref() == Some(agent_id) {
                let owner = claim.current_holder.clone();
                let eligible = state
                    .agents
                    .get(agent_id)
                    .is_some_and(|entry| entry.agent.status.is_active() && entry.agent.has_capacity());
                if eligible {
                    self.requeue_locked(&mut state, task_id, "ownership conflict lost")?;
                    self.assign_locked(&mut state, task_id, agent_id)?;
                    info!(
                        task_id = %task_id,
                        from = ?owner,
                        to = %agent_id,
                        "Task ownership transferred"
                    );
                    self.schedule_locked(&mut state, &blocked);
                } else {
                    warn!(task_id = %task_id, agent_id = %agent_id, "Conflict winner can no longer take the task");
                }
            }
            record
        };

        for loser in record.losers() {
            let payload = json!({
                "conflict_id": record.id,
                "entity_id": record.entity_id,
                "winner": record.resolved_winner,
            });
            if let Err(err) = self.inner.ctx.messaging.notify(
                Address::Coordinator,
                Recipient::Agent(loser.clone()),
                CONFLICT_LOST_TOPIC,
                payload,
            ) {
                debug!(agent_id = %loser, error = %err, "Could not notify conflict loser");
            }
        }

        Ok(ClaimOutcome::Contested(record))
    }

    async fn claim_unchanged(&self, task_id: &TaskId, epoch: u64) -> bool {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .get(task_id)
            .is_some_and(|entry| entry.epoch == epoch && entry.task.status == TaskStatus::Assigned)
    }

    fn check_claimant(&self, agent: &AgentEntry, task: &Task) -> Result<()> {
        if !agent.agent.status.is_active() {
            return Err(self.ineligible(&agent.agent.id, &task.id, "agent is not active"));
        }
        if !agent.agent.can_handle(&task.required_capabilities) {
            return Err(self.ineligible(&agent.agent.id, &task.id, "missing capabilities"));
        }
        Ok(())
    }

    fn ineligible(&self, agent_id: &AgentId, task_id: &TaskId, reason: &str) -> CoordinationError {
        CoordinationError::AgentIneligible {
            agent_id: agent_id.clone(),
            task_id: task_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn ownership_claim(
        &self,
        state: &mut SchedulerState,
        task_id: &TaskId,
        owner: &AgentId,
        owner_seq: u64,
        claimant: &AgentId,
    ) -> ConflictClaim {
        let claim_seq = state.next_seq();
        let priority_of = |id: &AgentId| {
            state
                .agents
                .get(id)
                .map(|entry| entry.agent.priority)
                .unwrap_or_default()
        };
        let assigned_at = state
            .tasks
            .get(task_id)
            .map(|entry| entry.task.updated_at)
            .unwrap_or_else(chrono::Utc::now);

        ConflictClaim {
            kind: ConflictKind::TaskOwnershipConflict,
            entity_id: task_id.to_string(),
            participants: vec![
                Claimant {
                    agent_id: owner.clone(),
                    priority: priority_of(owner),
                    claimed_at: assigned_at,
                    sequence: owner_seq,
                },
                Claimant {
                    agent_id: claimant.clone(),
                    priority: priority_of(claimant),
                    claimed_at: chrono::Utc::now(),
                    sequence: claim_seq,
                },
            ],
            current_holder: Some(owner.clone()),
        }
    }

    /// Ask every voter for a ballot; unanswered ballots simply do not count
    async fn collect_votes(&self, claim: &ConflictClaim, voters: &[AgentId]) -> Vec<Vote> {
        let timeout = self.inner.conflicts_config.vote_timeout();
        let candidates: Vec<&AgentId> = claim.participants.iter().map(|p| &p.agent_id).collect();
        let ballot = json!({
            "entity_id": claim.entity_id,
            "kind": claim.kind,
            "candidates": candidates,
        });

        let mut requests = JoinSet::new();
        for voter in voters {
            let messaging = self.inner.ctx.messaging.clone();
            let voter = voter.clone();
            let ballot = ballot.clone();
            requests.spawn(async move {
                let response = messaging
                    .request(
                        Address::Coordinator,
                        Recipient::Agent(voter.clone()),
                        VOTE_TOPIC,
                        ballot,
                        timeout,
                    )
                    .await;
                (voter, response)
            });
        }

        let mut votes = Vec::new();
        while let Some(joined) = requests.join_next().await {
            let Ok((voter, response)) = joined else {
                continue;
            };
            match response {
                Ok(message) => {
                    let Some(candidate) = message.payload.get("candidate").and_then(Value::as_str)
                    else {
                        debug!(voter = %voter, "Ballot without a candidate ignored");
                        continue;
                    };
                    let weight = message
                        .payload
                        .get("weight")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    votes.push(Vote {
                        voter,
                        candidate: AgentId::new(candidate),
                        weight,
                    });
                }
                Err(err) => debug!(voter = %voter, error = %err, "No ballot received"),
            }
        }
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        votes
    }

    // ---- work stealing ----

    /// Move unstarted work from overloaded agents to underloaded ones.
    /// Returns the moves that were applied.
    pub async fn rebalance(&self) -> Vec<StealProposal> {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;

        let snapshot = LoadSnapshot {
            agents: state
                .agents_in_order()
                .into_iter()
                .map(|entry| AgentLoad {
                    agent_id: entry.agent.id.clone(),
                    capabilities: entry.agent.capabilities.clone(),
                    max_concurrent_tasks: entry.agent.max_concurrent_tasks,
                    current_tasks: entry.agent.current_load(),
                    backlog: entry
                        .agent
                        .current_tasks
                        .iter()
                        .filter_map(|id| state.tasks.get(id))
                        .filter(|task| task.task.status == TaskStatus::Assigned)
                        .map(|task| StealCandidate {
                            task_id: task.task.id.clone(),
                            required_capabilities: task.task.required_capabilities.clone(),
                            assigned_seq: task.assigned_seq,
                        })
                        .collect(),
                    accepting: entry.agent.status.is_active()
                        && !blocked.contains(&agent_key(&entry.agent.id)),
                })
                .collect(),
        };

        let proposals = self.inner.stealer.plan(&snapshot);
        let mut applied = Vec::new();

        for proposal in proposals {
            let still_valid = state.tasks.get(&proposal.task_id).is_some_and(|entry| {
                entry.task.status == TaskStatus::Assigned
                    && entry.task.assigned_agent.as_ref() == Some(&proposal.from)
            }) && state.agents.get(&proposal.to).is_some_and(|entry| {
                entry.agent.status.is_active() && entry.agent.has_capacity()
            });
            if !still_valid {
                debug!(task_id = %proposal.task_id, "Steal proposal no longer valid");
                continue;
            }

            let moved = self
                .requeue_locked(&mut state, &proposal.task_id, "stolen")
                .and_then(|_| self.assign_locked(&mut state, &proposal.task_id, &proposal.to));
            match moved {
                Ok(()) => {
                    info!(
                        task_id = %proposal.task_id,
                        from = %proposal.from,
                        to = %proposal.to,
                        differential = proposal.differential,
                        "Task stolen"
                    );
                    self.inner.ctx.metrics.record_stolen();
                    self.inner.ctx.events.emit(CoordinationEvent::TaskStolen {
                        task_id: proposal.task_id.clone(),
                        from: proposal.from.clone(),
                        to: proposal.to.clone(),
                    });
                    applied.push(proposal);
                }
                Err(err) => warn!(task_id = %proposal.task_id, error = %err, "Steal failed"),
            }
        }

        if !applied.is_empty() {
            self.schedule_locked(&mut state, &blocked);
        }
        applied
    }

    // ---- pruning ----

    /// Archive terminal tasks finished more than `ttl` ago whose
    /// dependents are all terminal. Returns the archived ids.
    pub async fn prune(&self, ttl: Duration) -> Vec<TaskId> {
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();

        let mut candidates: Vec<(u64, TaskId)> = state
            .tasks
            .values()
            .filter(|entry| {
                entry.task.status.is_terminal()
                    && entry
                        .finished_at
                        .is_some_and(|finished| now.duration_since(finished) >= ttl)
            })
            .map(|entry| (entry.assigned_seq, entry.task.id.clone()))
            .collect();
        candidates.sort();

        let mut pruned = Vec::new();
        for (_, id) in candidates {
            let dependents_done = state.graph.dependents_of(&id).iter().all(|dep| {
                state
                    .tasks
                    .get(dep)
                    .map_or(true, |entry| entry.task.status.is_terminal())
            });
            if !dependents_done || state.graph.remove_task(&id).is_err() {
                continue;
            }
            if let Some(entry) = state.tasks.remove(&id) {
                state.archive.push_back(entry.task);
                pruned.push(id);
            }
        }

        while state.archive.len() > self.inner.config.archive_limit {
            state.archive.pop_front();
        }
        let forgotten = state.graph.trim_retired(self.inner.config.archive_limit);
        if forgotten > 0 {
            debug!(forgotten, "Forgot retired task ids");
        }
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned finished tasks");
        }
        pruned
    }

    // ---- internals (caller holds the state lock) ----

    fn enqueue_locked(&self, state: &mut SchedulerState, id: &TaskId) -> Result<()> {
        let seq = state.next_seq();
        let SchedulerState { tasks, queue, .. } = state;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))?;
        entry.transition(LifecycleEvent::Enqueue, &self.inner.ctx.events)?;
        let key = (Reverse(entry.task.priority), seq, id.clone());
        queue.insert(key.clone());
        entry.queue_key = Some(key);
        Ok(())
    }

    fn schedule_locked(&self, state: &mut SchedulerState, blocked: &HashSet<String>) {
        if state.queue.is_empty() || state.agents.is_empty() {
            return;
        }

        let queued: Vec<TaskId> = state.queue.iter().map(|(_, _, id)| id.clone()).collect();
        for task_id in queued {
            let choice = {
                let SchedulerState {
                    tasks,
                    agents,
                    strategy,
                    ..
                } = &mut *state;
                let Some(entry) = tasks.get(&task_id) else {
                    continue;
                };
                // Wait out open resource circuits in the queue
                if entry
                    .task
                    .resource_requirements
                    .iter()
                    .any(|resource_id| blocked.contains(&resource_key(resource_id)))
                {
                    continue;
                }
                let mut eligible: Vec<&AgentEntry> = agents
                    .values()
                    .filter(|agent| agent.eligible_for(&entry.task, blocked))
                    .collect();
                if eligible.is_empty() {
                    continue;
                }
                eligible.sort_by_key(|agent| agent.seq);
                let candidates: Vec<&Agent> = eligible.iter().map(|agent| &agent.agent).collect();
                strategy
                    .select(&entry.task, &candidates)
                    .and_then(|index| candidates.get(index))
                    .map(|agent| agent.id.clone())
            };

            if let Some(agent_id) = choice {
                if let Err(err) = self.assign_locked(state, &task_id, &agent_id) {
                    warn!(task_id = %task_id, agent_id = %agent_id, error = %err, "Assignment failed");
                }
            }
        }
    }

    fn assign_locked(&self, state: &mut SchedulerState, task_id: &TaskId, agent_id: &AgentId) -> Result<()> {
        let seq = state.next_seq();
        let events = &self.inner.ctx.events;
        let SchedulerState {
            tasks,
            queue,
            agents,
            ..
        } = state;

        let agent_entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))?;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinationError::TaskNotFound(task_id.clone()))?;

        entry.transition(LifecycleEvent::Assign, events)?;
        if let Some(key) = entry.queue_key.take() {
            queue.remove(&key);
        }
        entry.epoch += 1;
        entry.assigned_seq = seq;
        entry.task.assigned_agent = Some(agent_id.clone());
        agent_entry.agent.current_tasks.insert(task_id.clone());
        refresh_agent_status(&mut agent_entry.agent, events);

        info!(task_id = %task_id, agent_id = %agent_id, epoch = entry.epoch, "Task assigned");
        self.inner.ctx.metrics.record_assigned();
        events.emit(CoordinationEvent::TaskAssigned {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
        });

        let job = DispatchJob {
            task: entry.task.clone(),
            agent_id: agent_id.clone(),
            epoch: entry.epoch,
            executor: agent_entry.executor.clone(),
        };
        let span = create_coordination_span(
            "dispatch",
            Some(agent_id.as_str()),
            Some(task_id.as_str()),
            None,
        );
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.dispatch(job).await }.instrument(span));
        entry.dispatch = Some(handle.abort_handle());
        Ok(())
    }

    /// Return an Assigned or Running task to the queue
    fn requeue_locked(&self, state: &mut SchedulerState, task_id: &TaskId, reason: &str) -> Result<()> {
        let events = &self.inner.ctx.events;
        let entry = state.entry_mut(task_id)?;
        entry.stop_jobs();
        entry.transition(LifecycleEvent::Requeue, events)?;
        entry.task.set_reason(REQUEUE_REASON, reason);
        let owner = entry.task.assigned_agent.take();
        events.emit(CoordinationEvent::TaskRequeued {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });
        debug!(task_id = %task_id, reason = %reason, "Task requeued");

        if let Some(owner) = owner {
            state.detach_from_agent(task_id, &owner, events);
        }

        let seq = state.next_seq();
        let SchedulerState { tasks, queue, .. } = state;
        if let Some(entry) = tasks.get_mut(task_id) {
            let key = (Reverse(entry.task.priority), seq, task_id.clone());
            queue.insert(key.clone());
            entry.queue_key = Some(key);
        }
        Ok(())
    }

    /// The task is in Failed. Either schedule a retry or make the failure
    /// terminal and abandon everything that depends on it.
    fn fail_locked(&self, state: &mut SchedulerState, task_id: &TaskId, reason: &str) -> Result<()> {
        let events = &self.inner.ctx.events;
        let entry = state.entry_mut(task_id)?;
        entry.stop_jobs();
        entry.task.last_error = Some(reason.to_string());
        if let Some(owner) = entry.task.assigned_agent.take() {
            state.detach_from_agent(task_id, &owner, events);
            if let Some(agent) = state.agents.get_mut(&owner) {
                agent.agent.failed_tasks += 1;
            }
        }

        let entry = state.entry_mut(task_id)?;
        if entry.task.retry_count < entry.task.max_retries {
            let delay = self.inner.retry.delay_for(entry.task.retry_count);
            entry.task.retry_count += 1;
            entry.transition(LifecycleEvent::Retry, events)?;
            let retry_count = entry.task.retry_count;

            warn!(
                task_id = %task_id,
                retry_count,
                max_retries = entry.task.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Task failed, retrying"
            );
            self.inner.ctx.metrics.record_retry();
            events.emit(CoordinationEvent::TaskRetrying {
                task_id: task_id.clone(),
                retry_count,
                delay_ms: delay.as_millis() as u64,
            });

            let commands = self.inner.commands.clone();
            let id = task_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if commands.send(SchedulerCommand::RetryDue(id)).await.is_err() {
                    debug!("Scheduler gone before retry was due");
                }
            });
            entry.retry_timer = Some(timer.abort_handle());
            return Ok(());
        }

        let exhausted = CoordinationError::RetriesExhausted {
            task_id: task_id.clone(),
            attempts: entry.task.attempts,
            last_error: reason.to_string(),
        };
        entry.task.set_reason(FAILURE_REASON, exhausted.to_string());
        warn!(task_id = %task_id, attempts = entry.task.attempts, error = %reason, "Task failed permanently");
        self.inner.ctx.metrics.record_failed();
        events.emit(CoordinationEvent::TaskFailed {
            task_id: task_id.clone(),
            reason: exhausted.to_string(),
        });

        self.abandon_dependents_locked(state, task_id);
        Ok(())
    }

    fn cancel_locked(&self, state: &mut SchedulerState, task_id: &TaskId, reason: &str) -> Result<()> {
        self.cancel_one_locked(state, task_id, reason)?;
        self.abandon_dependents_locked(state, task_id);
        Ok(())
    }

    fn cancel_one_locked(&self, state: &mut SchedulerState, task_id: &TaskId, reason: &str) -> Result<()> {
        let events = &self.inner.ctx.events;
        let SchedulerState { tasks, queue, .. } = &mut *state;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinationError::TaskNotFound(task_id.clone()))?;

        entry.transition(LifecycleEvent::Cancel, events)?;
        entry.stop_jobs();
        if let Some(key) = entry.queue_key.take() {
            queue.remove(&key);
        }
        entry.task.set_reason(CANCEL_REASON, reason);
        let owner = entry.task.assigned_agent.take();

        info!(task_id = %task_id, reason = %reason, "Task cancelled");
        self.inner.ctx.metrics.record_cancelled();
        events.emit(CoordinationEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });

        if let Some(owner) = owner {
            state.detach_from_agent(task_id, &owner, events);
        }
        Ok(())
    }

    fn abandon_dependents_locked(&self, state: &mut SchedulerState, task_id: &TaskId) {
        let abandoned = state.graph.mark_abandoned(task_id);
        let reason = format!("dependency {task_id} did not complete");
        for dependent in abandoned {
            if let Err(err) = self.cancel_one_locked(state, &dependent, &reason) {
                warn!(task_id = %dependent, error = %err, "Could not cancel dependent task");
            }
        }
    }

    /// Mark an agent Offline/Failed and evict its tasks
    fn take_agent_down_locked(&self, state: &mut SchedulerState, agent_id: &AgentId, status: AgentStatus, reason: &str) {
        let Some(entry) = state.agents.get_mut(agent_id) else {
            return;
        };
        let from = entry.agent.status;
        entry.agent.status = status;
        warn!(agent_id = %agent_id, from = %from, to = %status, reason = %reason, "Agent unavailable");
        self.inner.ctx.events.emit(CoordinationEvent::AgentStatusChanged {
            agent_id: agent_id.clone(),
            from,
            to: status,
        });
        self.inner.ctx.events.emit(CoordinationEvent::AgentOffline {
            agent_id: agent_id.clone(),
            reason: reason.to_string(),
        });
        self.evict_agent_tasks_locked(state, agent_id, reason);
    }

    /// Requeue the agent's unstarted tasks, fail its running ones
    fn evict_agent_tasks_locked(&self, state: &mut SchedulerState, agent_id: &AgentId, reason: &str) {
        let held: Vec<TaskId> = state
            .agents
            .get(agent_id)
            .map(|entry| entry.agent.current_tasks.iter().cloned().collect())
            .unwrap_or_default();

        for task_id in held {
            let status = state.tasks.get(&task_id).map(|entry| entry.task.status);
            let result = match status {
                Some(TaskStatus::Assigned) => self.requeue_locked(state, &task_id, reason),
                Some(TaskStatus::Running) => state
                    .entry_mut(&task_id)
                    .and_then(|entry| {
                        entry.stop_jobs();
                        entry.transition(LifecycleEvent::Fail, &self.inner.ctx.events)
                    })
                    .and_then(|_| self.fail_locked(state, &task_id, reason)),
                _ => {
                    state.detach_from_agent(&task_id, agent_id, &self.inner.ctx.events);
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %err, "Could not evict task");
            }
        }
    }

    // ---- dispatch (runs in its own tokio task) ----

    async fn dispatch(&self, job: DispatchJob) {
        let mut held = HeldLeases {
            resources: self.inner.ctx.resources.clone(),
            leases: Vec::new(),
        };

        // BTreeSet iteration gives a global acquisition order
        for resource_id in &job.task.resource_requirements {
            let request = ResourceRequest::new(
                resource_id.clone(),
                job.agent_id.clone(),
                job.task.priority,
                self.inner.acquire_timeout,
            )
            .for_task(job.task.id.clone());

            let key = resource_key(resource_id);
            if let Err(err) = self.inner.ctx.breakers.check(&key) {
                drop(held);
                self.on_circuit_rejected(&job, err).await;
                return;
            }
            let permit = BreakerPermit {
                breakers: self.inner.ctx.breakers.clone(),
                key,
                settled: false,
            };

            match self.inner.ctx.resources.acquire(request).await {
                Ok(lease) => {
                    permit.settle(true);
                    held.leases.push(lease);
                }
                Err(err) => {
                    // Deadlock victims and lost holders say nothing about the resource
                    if matches!(err, CoordinationError::ResourceTimeout { .. }) {
                        permit.settle(false);
                    } else {
                        drop(permit);
                    }
                    drop(held);
                    self.on_acquire_failed(&job, err).await;
                    return;
                }
            }
        }

        let key = agent_key(&job.agent_id);
        if let Err(err) = self.inner.ctx.breakers.check(&key) {
            drop(held);
            self.on_circuit_rejected(&job, err).await;
            return;
        }
        let permit = BreakerPermit {
            breakers: self.inner.ctx.breakers.clone(),
            key,
            settled: false,
        };

        let Some(task) = self.mark_running(&job).await else {
            return;
        };

        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.task_timeout());
        let outcome = match tokio::time::timeout(timeout, job.executor.execute(&task)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(_) => Err(format!("executor timed out after {}ms", timeout.as_millis())),
        };

        permit.settle(outcome.is_ok());
        drop(held);
        self.finish(&job, outcome).await;
    }

    async fn mark_running(&self, job: &DispatchJob) -> Option<Task> {
        let mut state = self.inner.state.lock().await;
        let entry = state.tasks.get_mut(&job.task.id)?;
        if entry.epoch != job.epoch || entry.task.status != TaskStatus::Assigned {
            self.inner.ctx.metrics.record_stale_result();
            return None;
        }

        if let Err(err) = entry.transition(LifecycleEvent::Start, &self.inner.ctx.events) {
            warn!(task_id = %job.task.id, error = %err, "Could not start task");
            return None;
        }
        entry.task.attempts += 1;
        entry.task.started_at = Some(chrono::Utc::now());
        entry.acquire_failures = 0;
        entry.task.metadata.remove(LAST_ACQUIRE_ERROR);

        info!(task_id = %job.task.id, agent_id = %job.agent_id, attempt = entry.task.attempts, "Task started");
        self.inner.ctx.events.emit(CoordinationEvent::TaskStarted {
            task_id: job.task.id.clone(),
            agent_id: job.agent_id.clone(),
            attempt: entry.task.attempts,
        });
        Some(entry.task.clone())
    }

    fn is_current(&self, state: &SchedulerState, job: &DispatchJob, status: TaskStatus) -> bool {
        state
            .tasks
            .get(&job.task.id)
            .is_some_and(|entry| entry.epoch == job.epoch && entry.task.status == status)
    }

    async fn on_acquire_failed(&self, job: &DispatchJob, err: CoordinationError) {
        self.inner.ctx.metrics.record_acquire_failure();
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        if !self.is_current(&state, job, TaskStatus::Assigned) {
            self.inner.ctx.metrics.record_stale_result();
            return;
        }

        let failures = match state.entry_mut(&job.task.id) {
            Ok(entry) => {
                entry.dispatch = None;
                entry.acquire_failures += 1;
                entry.task.set_reason(LAST_ACQUIRE_ERROR, err.to_string());
                entry.acquire_failures
            }
            Err(_) => return,
        };
        warn!(
            task_id = %job.task.id,
            agent_id = %job.agent_id,
            failures,
            error = %err,
            "Resource acquisition failed"
        );

        let result = if failures >= self.inner.config.max_acquire_attempts {
            let reason = format!("resource acquisition failed {failures} times: {err}");
            state
                .entry_mut(&job.task.id)
                .and_then(|entry| {
                    entry.acquire_failures = 0;
                    entry.transition(LifecycleEvent::Fail, &self.inner.ctx.events)
                })
                .and_then(|_| self.fail_locked(&mut state, &job.task.id, &reason))
        } else {
            self.requeue_locked(&mut state, &job.task.id, err.kind())
        };
        if let Err(err) = result {
            warn!(task_id = %job.task.id, error = %err, "Could not handle acquisition failure");
        }
        self.schedule_locked(&mut state, &blocked);
    }

    async fn on_circuit_rejected(&self, job: &DispatchJob, err: CoordinationError) {
        self.inner.ctx.metrics.record_circuit_rejection();
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let mut state = self.inner.state.lock().await;
        if !self.is_current(&state, job, TaskStatus::Assigned) {
            self.inner.ctx.metrics.record_stale_result();
            return;
        }
        debug!(task_id = %job.task.id, agent_id = %job.agent_id, error = %err, "Circuit open; task requeued");
        if let Ok(entry) = state.entry_mut(&job.task.id) {
            entry.dispatch = None;
        }
        if let Err(err) = self.requeue_locked(&mut state, &job.task.id, err.kind()) {
            warn!(task_id = %job.task.id, error = %err, "Could not requeue task");
        }
        self.schedule_locked(&mut state, &blocked);
    }

    async fn finish(&self, job: &DispatchJob, outcome: std::result::Result<crate::types::TaskOutput, String>) {
        let blocked = self.inner.ctx.breakers.rejecting_keys();
        let ready = {
            let mut state = self.inner.state.lock().await;
            if !self.is_current(&state, job, TaskStatus::Running) {
                debug!(task_id = %job.task.id, epoch = job.epoch, "Discarding stale dispatch result");
                self.inner.ctx.metrics.record_stale_result();
                return;
            }

            let ready = match outcome {
                Ok(output) => self.complete_locked(&mut state, job, output),
                Err(reason) => state
                    .entry_mut(&job.task.id)
                    .and_then(|entry| {
                        entry.dispatch = None;
                        entry.transition(LifecycleEvent::Fail, &self.inner.ctx.events)
                    })
                    .and_then(|_| self.fail_locked(&mut state, &job.task.id, &reason))
                    .map(|_| Vec::new()),
            };
            self.schedule_locked(&mut state, &blocked);

            match ready {
                Ok(ready) => ready,
                Err(err) => {
                    warn!(task_id = %job.task.id, error = %err, "Could not record task outcome");
                    Vec::new()
                }
            }
        };

        for id in ready {
            if self
                .inner
                .commands
                .send(SchedulerCommand::TaskReady(id))
                .await
                .is_err()
            {
                debug!("Scheduler loop gone; ready notification dropped");
            }
        }
    }

    fn complete_locked(
        &self,
        state: &mut SchedulerState,
        job: &DispatchJob,
        output: crate::types::TaskOutput,
    ) -> Result<Vec<TaskId>> {
        let events = &self.inner.ctx.events;
        let entry = state.entry_mut(&job.task.id)?;
        entry.dispatch = None;
        entry.transition(LifecycleEvent::Complete, events)?;
        entry.task.result = Some(serde_json::to_value(&output).unwrap_or(Value::Null));
        entry.task.last_error = None;
        entry.task.assigned_agent = None;
        let task_type = entry.task.task_type.clone();

        state.detach_from_agent(&job.task.id, &job.agent_id, events);
        if let Some(agent) = state.agents.get_mut(&job.agent_id) {
            agent.agent.completed_tasks += 1;
            agent.agent.last_completed_type = Some(task_type);
        }

        info!(task_id = %job.task.id, agent_id = %job.agent_id, "Task completed");
        self.inner.ctx.metrics.record_completed();
        events.emit(CoordinationEvent::TaskCompleted {
            task_id: job.task.id.clone(),
            agent_id: job.agent_id.clone(),
        });

        state.graph.mark_completed(&job.task.id)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
