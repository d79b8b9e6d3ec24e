// Coordination Manager - facade over the scheduler and its collaborators
//
// Owns every shared component, runs the background loops (scheduler
// commands, contention auditing, maintenance) and exposes the
// administrative API used by the CLI and embedding applications.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::CoordinationConfig;
use crate::conflict::{Claimant, ConflictClaim, ConflictKind, ConflictResolver, ResolutionStrategy};
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, EventReceiver};
use crate::executor::TaskExecutor;
use crate::messaging::{Address, Mailbox, MessagingSystem, Recipient};
use crate::observability::{CoordinationMetrics, MetricsSnapshot};
use crate::priority::Priority;
use crate::resources::{ContentionReport, Lease, ResourceManager, ResourceRequest};
use crate::scheduler::{ClaimOutcome, Scheduler, SchedulerContext, CONFLICT_LOST_TOPIC};
use crate::shutdown::ShutdownCoordinator;
use crate::store::StateStore;
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::time_operation;
use crate::types::{Agent, AgentId, AgentSpec, AgentStatus, ResourceId, Task, TaskId, TaskSpec, TaskStatus};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Open circuits, or some registered agents are not available
    Degraded,
    /// Outstanding work and no agent able to take it
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub queue_depth: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub open_circuits: Vec<String>,
    pub deadlocks_resolved: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub conflicts_recorded: u64,
    pub pending_requests: usize,
}

/// Builder for [`CoordinationManager`]
#[derive(Default)]
pub struct CoordinationManagerBuilder {
    config: Option<CoordinationConfig>,
    store: Option<Arc<dyn StateStore>>,
}

impl CoordinationManagerBuilder {
    pub fn config(mut self, config: CoordinationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Checkpoint task and agent snapshots to `store`
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> anyhow::Result<CoordinationManager> {
        let config = self.config.unwrap_or_default();
        config.validate().context("invalid coordination configuration")?;

        let events = EventBus::new(config.observability.event_buffer);
        let (contention_tx, contention_rx) = mpsc::channel(config.resources.contention_buffer.max(1));
        let resources = ResourceManager::with_contention_channel(events.clone(), contention_tx);
        let messaging = MessagingSystem::new(config.messaging.clone(), events.clone());
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            events.clone(),
        ));
        let conflicts = Arc::new(ConflictResolver::new(
            config.conflicts.retention,
            config.conflicts.quorum,
            events.clone(),
        ));
        let metrics = Arc::new(CoordinationMetrics::new());

        let scheduler = Scheduler::new(
            &config,
            SchedulerContext {
                events: events.clone(),
                resources: resources.clone(),
                messaging: messaging.clone(),
                breakers: breakers.clone(),
                conflicts: conflicts.clone(),
                metrics: metrics.clone(),
            },
        );

        Ok(CoordinationManager {
            inner: Arc::new(ManagerInner {
                config,
                events,
                resources,
                messaging,
                breakers,
                conflicts,
                metrics,
                scheduler,
                store: self.store,
                shutdown: ShutdownCoordinator::new(),
                contention_rx: parking_lot::Mutex::new(Some(contention_rx)),
            }),
        })
    }
}

struct ManagerInner {
    config: CoordinationConfig,
    events: EventBus,
    resources: ResourceManager,
    messaging: MessagingSystem,
    breakers: Arc<CircuitBreakerManager>,
    conflicts: Arc<ConflictResolver>,
    metrics: Arc<CoordinationMetrics>,
    scheduler: Scheduler,
    store: Option<Arc<dyn StateStore>>,
    shutdown: ShutdownCoordinator,
    contention_rx: parking_lot::Mutex<Option<mpsc::Receiver<ContentionReport>>>,
}

/// Entry point of the engine. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationManager {
    inner: Arc<ManagerInner>,
}

impl CoordinationManager {
    pub fn new(config: CoordinationConfig) -> anyhow::Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> CoordinationManagerBuilder {
        CoordinationManagerBuilder::default()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.inner.config
    }

    /// Spawn the scheduler loop, the contention auditor and the
    /// maintenance loop. Calling it twice has no effect.
    pub fn start(&self) {
        let Some(contention) = self.inner.contention_rx.lock().take() else {
            debug!("Coordination manager already started");
            return;
        };

        let scheduler = self.inner.scheduler.clone();
        let signal = self.inner.shutdown.subscribe();
        self.inner.shutdown.register(
            "scheduler",
            tokio::spawn(async move { scheduler.run(signal).await }),
        );

        let manager = self.clone();
        let signal = self.inner.shutdown.subscribe();
        self.inner.shutdown.register(
            "contention",
            tokio::spawn(async move { manager.audit_contention(contention, signal).await }),
        );

        let manager = self.clone();
        let signal = self.inner.shutdown.subscribe();
        self.inner.shutdown.register(
            "maintenance",
            tokio::spawn(async move { manager.maintenance_loop(signal).await }),
        );

        info!("Coordination manager started");
    }

    /// Stop the background loops. Returns how many had to be aborted.
    pub async fn shutdown(&self) -> usize {
        info!("Coordination manager shutting down");
        let aborted = self.inner.shutdown.shutdown(SHUTDOWN_GRACE).await;
        self.inner.metrics.log_snapshot();
        aborted
    }

    /// Resolves once Ctrl-C is received
    pub async fn wait_for_signal(&self) -> anyhow::Result<()> {
        self.inner.shutdown.wait_for_signal().await
    }

    // ---- administrative API ----

    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.inner.scheduler.create_task(spec).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.inner.scheduler.cancel_task(task_id, reason).await
    }

    pub async fn remove_task(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.inner.scheduler.remove_task(task_id).await?;
        self.forget(&format!("task/{task_id}")).await;
        Ok(task)
    }

    pub async fn add_dependency(&self, task_id: &TaskId, dependency: &TaskId) -> Result<()> {
        self.inner.scheduler.add_dependency(task_id, dependency).await
    }

    pub async fn register_agent(
        &self,
        spec: AgentSpec,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Mailbox> {
        self.inner.scheduler.register_agent(spec, executor).await
    }

    pub async fn deregister_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        let agent = self.inner.scheduler.deregister_agent(agent_id).await?;
        self.forget(&format!("agent/{agent_id}")).await;
        if self.inner.config.work_stealing.enabled {
            self.inner.scheduler.rebalance().await;
        }
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        self.inner.scheduler.heartbeat(agent_id).await
    }

    pub async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        self.inner.scheduler.set_agent_status(agent_id, status).await
    }

    pub async fn claim_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<ClaimOutcome> {
        self.inner.scheduler.claim_task(task_id, agent_id).await
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        self.inner.scheduler.get_task_status(task_id).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.inner
            .scheduler
            .get_task(task_id)
            .await
            .ok_or_else(|| CoordinationError::TaskNotFound(task_id.clone()))
    }

    pub async fn get_agent_status(&self, agent_id: &AgentId) -> Result<AgentStatus> {
        self.inner.scheduler.get_agent_status(agent_id).await
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        self.inner
            .scheduler
            .get_agent(agent_id)
            .await
            .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.clone()))
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.inner.scheduler.list_tasks().await
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.inner.scheduler.list_agents().await
    }

    /// Wait for a task to reach a terminal state; on timeout the current
    /// snapshot is returned
    pub async fn wait_for_task(&self, task_id: &TaskId, timeout: Duration) -> Result<Task> {
        self.inner.scheduler.wait_for_task(task_id, timeout).await
    }

    /// Lock a resource directly on behalf of a registered agent
    pub async fn acquire_resource(
        &self,
        resource_id: impl Into<ResourceId>,
        agent_id: &AgentId,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Lease> {
        if self.inner.scheduler.get_agent(agent_id).await.is_none() {
            return Err(CoordinationError::AgentNotFound(agent_id.clone()));
        }
        self.inner
            .resources
            .acquire(ResourceRequest::new(resource_id, agent_id.clone(), priority, timeout))
            .await
    }

    pub fn release_resource(&self, resource_id: &ResourceId, agent_id: &AgentId) -> Result<()> {
        self.inner.resources.release(resource_id, agent_id)
    }

    pub async fn get_health(&self) -> HealthReport {
        let stats = self.inner.scheduler.stats().await;
        let metrics = self.inner.metrics.snapshot();
        let open_circuits = self.inner.breakers.open_keys();

        let status = if stats.healthy_agents == 0 && stats.outstanding() > 0 {
            HealthStatus::Unhealthy
        } else if !open_circuits.is_empty() || stats.healthy_agents < stats.total_agents {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            total_agents: stats.total_agents,
            healthy_agents: stats.healthy_agents,
            queue_depth: stats.queue_depth,
            pending_tasks: stats.pending_tasks,
            running_tasks: stats.running_tasks,
            open_circuits,
            deadlocks_resolved: self.inner.resources.deadlocks_resolved(),
            tasks_completed: metrics.tasks_completed,
            tasks_failed: metrics.tasks_failed,
            conflicts_recorded: self.inner.conflicts.stats().recorded,
            pending_requests: self.inner.messaging.pending_requests(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn messaging(&self) -> &MessagingSystem {
        &self.inner.messaging
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.inner.conflicts
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.inner.breakers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // ---- background loops ----

    /// Record every contended grant as a resolved conflict and tell the
    /// losing agents
    async fn audit_contention(
        &self,
        mut reports: mpsc::Receiver<ContentionReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                report = reports.recv() => {
                    let Some(report) = report else { break };
                    self.record_contention(report);
                }
            }
        }
        debug!("Contention auditor stopped");
    }

    fn record_contention(&self, report: ContentionReport) {
        let claim = ConflictClaim {
            kind: ConflictKind::ResourceContention,
            entity_id: report.resource_id.to_string(),
            participants: report
                .participants
                .iter()
                .map(|p| Claimant {
                    agent_id: p.agent_id.clone(),
                    priority: p.priority,
                    claimed_at: p.requested_at,
                    sequence: p.sequence,
                })
                .collect(),
            current_holder: Some(report.winner.clone()),
        };
        let record = self
            .inner
            .conflicts
            .settle(&claim, ResolutionStrategy::Priority, &[], 0);

        if record.resolved_winner.as_ref() != Some(&report.winner) {
            warn!(
                resource_id = %report.resource_id,
                granted = %report.winner,
                audited = ?record.resolved_winner,
                "Contention audit disagrees with grant order"
            );
        }

        for loser in record.losers() {
            let payload = json!({
                "conflict_id": record.id,
                "resource_id": report.resource_id,
                "winner": report.winner,
            });
            if let Err(err) = self.inner.messaging.notify(
                Address::Coordinator,
                Recipient::Agent(loser.clone()),
                CONFLICT_LOST_TOPIC,
                payload,
            ) {
                debug!(agent_id = %loser, error = %err, "Could not notify contention loser");
            }
        }
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.inner.config;
        let tick = |period: Duration| {
            let mut timer = interval(period.max(Duration::from_millis(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        };
        let mut deadlock_timer = tick(config.resources.deadlock_scan_interval());
        let mut sweep_timer = tick(config.messaging.sweep_interval());
        let mut rebalance_timer = tick(config.work_stealing.interval());
        let mut health_timer = tick(config.maintenance.health_interval());
        let mut prune_timer = tick(config.maintenance.prune_interval());
        let mut last_checkpoint: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = deadlock_timer.tick() => {
                    self.bounded("deadlock_scan", async {
                        let reports = time_operation!("deadlock_scan", self.inner.resources.detect_deadlocks());
                        if !reports.is_empty() {
                            info!(resolved = reports.len(), "Deadlocks resolved");
                        }
                    }).await;
                }
                _ = sweep_timer.tick() => {
                    self.bounded("message_sweep", async {
                        let expired = self.inner.messaging.sweep_expired();
                        if expired > 0 {
                            debug!(expired, "Expired pending requests");
                        }
                    }).await;
                }
                _ = rebalance_timer.tick() => {
                    self.bounded("rebalance", async {
                        if config.work_stealing.enabled {
                            self.inner.scheduler.rebalance().await;
                        }
                        // Picks up agents whose circuits closed since the last pass
                        self.inner.scheduler.schedule_once().await;
                    }).await;
                }
                _ = health_timer.tick() => {
                    self.bounded("health_check", self.health_check(&mut last_checkpoint)).await;
                }
                _ = prune_timer.tick() => {
                    self.bounded("prune", self.prune()).await;
                }
            }
        }
        debug!("Maintenance loop stopped");
    }

    /// Run one maintenance job within the configured time slice
    async fn bounded<F>(&self, job: &str, work: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let limit = self.inner.config.maintenance.max_job_duration();
        let span = create_coordination_span(job, None, None, Some(&generate_correlation_id()));
        if tokio::time::timeout(limit, work.instrument(span)).await.is_err() {
            self.inner.metrics.record_maintenance_overrun();
            warn!(job = %job, limit_ms = limit.as_millis() as u64, "Maintenance job overran its slice");
        }
    }

    async fn health_check(&self, last_checkpoint: &mut Option<DateTime<Utc>>) {
        if let Some(ttl) = self.inner.config.maintenance.heartbeat_timeout() {
            let expired = self.inner.scheduler.expire_heartbeats(ttl).await;
            for agent_id in expired {
                warn!(agent_id = %agent_id, "Agent missed heartbeats, marked offline");
            }
        }

        let health = self.get_health().await;
        debug!(
            status = %health.status,
            healthy_agents = health.healthy_agents,
            queue_depth = health.queue_depth,
            open_circuits = health.open_circuits.len(),
            "Health check"
        );
        if self.inner.config.observability.metrics_enabled {
            self.inner.metrics.log_snapshot();
        }

        if self.inner.store.is_some() {
            let started = Utc::now();
            if self.checkpoint(*last_checkpoint).await {
                *last_checkpoint = Some(started);
            }
        }
    }

    /// Write changed tasks and every agent to the store. Returns false if
    /// any write failed so the next pass retries them.
    async fn checkpoint(&self, since: Option<DateTime<Utc>>) -> bool {
        let Some(store) = &self.inner.store else {
            return true;
        };
        let tasks = match since {
            Some(since) => self.inner.scheduler.tasks_updated_since(since).await,
            None => self.inner.scheduler.list_tasks().await,
        };
        let agents = self.inner.scheduler.list_agents().await;

        let mut complete = true;
        for task in &tasks {
            let written = match serde_json::to_value(task) {
                Ok(value) => store.put(&format!("task/{}", task.id), value).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = written {
                warn!(task_id = %task.id, error = %err, "Task checkpoint failed");
                complete = false;
            }
        }
        for agent in &agents {
            let written = match serde_json::to_value(agent) {
                Ok(value) => store.put(&format!("agent/{}", agent.id), value).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = written {
                warn!(agent_id = %agent.id, error = %err, "Agent checkpoint failed");
                complete = false;
            }
        }
        debug!(tasks = tasks.len(), agents = agents.len(), "Checkpoint written");
        complete
    }

    async fn prune(&self) {
        let ttl = self.inner.config.maintenance.finished_task_ttl();
        let pruned = self.inner.scheduler.prune(ttl).await;
        for task_id in &pruned {
            self.forget(&format!("task/{task_id}")).await;
        }
    }

    async fn forget(&self, key: &str) {
        if let Some(store) = &self.inner.store {
            if let Err(err) = store.delete(key).await {
                warn!(key = %key, error = %err, "Could not delete checkpoint");
            }
        }
    }
}

impl std::fmt::Debug for CoordinationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationManager")
            .field("shutdown", &self.inner.shutdown)
            .finish_non_exhaustive()
    }
}
