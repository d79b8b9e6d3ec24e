//! Resource Manager
//!
//! In-process mutual exclusion over named resources. Each resource has at
//! most one holding agent and a wait queue ordered by priority (highest
//! first) with FIFO tie-break. Waiters are suspended on a oneshot channel
//! and always resolve: granted, timed out, aborted as a deadlock victim,
//! or failed because their agent went away.
//!
//! The table is guarded by a synchronous mutex that is never held across
//! an await, so a dropped `acquire` future can clean up after itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::priority::Priority;
use crate::types::{AgentId, ResourceId, TaskId};

#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub resource_id: ResourceId,
    pub agent_id: AgentId,
    /// Task the resource is acquired for, if any
    pub task_id: Option<TaskId>,
    pub priority: Priority,
    pub timeout: Duration,
}

impl ResourceRequest {
    pub fn new(
        resource_id: impl Into<ResourceId>,
        agent_id: impl Into<AgentId>,
        priority: impl Into<Priority>,
        timeout: Duration,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            agent_id: agent_id.into(),
            task_id: None,
            priority: priority.into(),
            timeout,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Proof of holding a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub lease_id: u64,
    pub resource_id: ResourceId,
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub acquired_at: DateTime<Utc>,
}

/// Several agents contended for one resource; the grant went to `winner`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionReport {
    pub resource_id: ResourceId,
    /// Winner first, then the agents still waiting in queue order
    pub participants: Vec<ContentionParticipant>,
    pub winner: AgentId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionParticipant {
    pub agent_id: AgentId,
    pub priority: Priority,
    pub requested_at: DateTime<Utc>,
    pub sequence: u64,
}

/// One broken wait-for cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    /// Agents in the cycle, starting with the first agent found on it
    pub cycle: Vec<AgentId>,
    /// Resources the cycle waits on, parallel to `cycle`
    pub resources: Vec<ResourceId>,
    pub victim: AgentId,
    pub victim_task: Option<TaskId>,
    pub victim_resource: ResourceId,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaiterSnapshot {
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub priority: Priority,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub resource_id: ResourceId,
    pub holder: Option<AgentId>,
    pub holder_task: Option<TaskId>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub waiters: Vec<WaiterSnapshot>,
}

type GrantSender = oneshot::Sender<Result<Lease>>;

struct Waiter {
    sequence: u64,
    agent_id: AgentId,
    task_id: Option<TaskId>,
    priority: Priority,
    requested_at: DateTime<Utc>,
    enqueued: Instant,
    sender: GrantSender,
}

impl Waiter {
    fn participant(&self) -> ContentionParticipant {
        ContentionParticipant {
            agent_id: self.agent_id.clone(),
            priority: self.priority,
            requested_at: self.requested_at,
            sequence: self.sequence,
        }
    }
}

#[derive(Default)]
struct ResourceEntry {
    holder: Option<Lease>,
    /// Sorted: priority descending, then sequence ascending
    queue: Vec<Waiter>,
}

impl ResourceEntry {
    fn insert_waiter(&mut self, waiter: Waiter) {
        let position = self.queue.partition_point(|queued| {
            queued.priority > waiter.priority
                || (queued.priority == waiter.priority && queued.sequence < waiter.sequence)
        });
        self.queue.insert(position, waiter);
    }

    fn remove_waiter(&mut self, sequence: u64) -> Option<Waiter> {
        let position = self.queue.iter().position(|w| w.sequence == sequence)?;
        Some(self.queue.remove(position))
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct ResourceTable {
    resources: BTreeMap<ResourceId, ResourceEntry>,
    next_sequence: u64,
    next_lease: u64,
}

impl ResourceTable {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn new_lease(
        &mut self,
        resource_id: &ResourceId,
        agent_id: &AgentId,
        task_id: Option<TaskId>,
    ) -> Lease {
        self.next_lease += 1;
        Lease {
            lease_id: self.next_lease,
            resource_id: resource_id.clone(),
            agent_id: agent_id.clone(),
            task_id,
            acquired_at: Utc::now(),
        }
    }
}

struct Shared {
    table: Mutex<ResourceTable>,
    events: EventBus,
    contention: Option<mpsc::Sender<ContentionReport>>,
    deadlocks_resolved: AtomicU64,
}

/// Cheap to clone; all clones share one resource table
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<Shared>,
}

impl ResourceManager {
    pub fn new(events: EventBus) -> Self {
        Self::build(events, None)
    }

    /// Contention reports are pushed to `contention` without blocking;
    /// reports are dropped when the channel is full.
    pub fn with_contention_channel(
        events: EventBus,
        contention: mpsc::Sender<ContentionReport>,
    ) -> Self {
        Self::build(events, Some(contention))
    }

    fn build(events: EventBus, contention: Option<mpsc::Sender<ContentionReport>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(ResourceTable::default()),
                events,
                contention,
                deadlocks_resolved: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire `request.resource_id` for `request.agent_id`, waiting at
    /// most `request.timeout`. Dropping the returned future withdraws the
    /// request.
    pub async fn acquire(&self, request: ResourceRequest) -> Result<Lease> {
        let (sequence, receiver) = {
            let mut table = self.shared.table.lock();
            let sequence = table.next_sequence();

            let free = table
                .resources
                .get(&request.resource_id)
                .map_or(true, |entry| entry.is_idle());
            if free {
                let lease = table.new_lease(
                    &request.resource_id,
                    &request.agent_id,
                    request.task_id.clone(),
                );
                table
                    .resources
                    .entry(request.resource_id.clone())
                    .or_default()
                    .holder = Some(lease.clone());
                drop(table);

                debug!(
                    resource_id = %request.resource_id,
                    agent_id = %request.agent_id,
                    "Resource granted immediately"
                );
                self.shared.events.emit(CoordinationEvent::ResourceAcquired {
                    resource_id: request.resource_id,
                    agent_id: request.agent_id,
                    waited_ms: 0,
                });
                return Ok(lease);
            }

            let (sender, receiver) = oneshot::channel();
            let entry = table.resources.entry(request.resource_id.clone()).or_default();
            entry.insert_waiter(Waiter {
                sequence,
                agent_id: request.agent_id.clone(),
                task_id: request.task_id.clone(),
                priority: request.priority,
                requested_at: Utc::now(),
                enqueued: Instant::now(),
                sender,
            });
            debug!(
                resource_id = %request.resource_id,
                agent_id = %request.agent_id,
                priority = %request.priority,
                queue_len = entry.queue.len(),
                "Resource busy, request queued"
            );
            (sequence, receiver)
        };

        let mut pending = PendingAcquire {
            manager: self.clone(),
            resource_id: request.resource_id.clone(),
            sequence,
            receiver: Some(receiver),
        };
        pending.wait(&request).await
    }

    /// Release a resource held by `agent_id`
    pub fn release(&self, resource_id: &ResourceId, agent_id: &AgentId) -> Result<()> {
        let mut table = self.shared.table.lock();
        let holder = table
            .resources
            .get(resource_id)
            .and_then(|entry| entry.holder.as_ref());

        match holder {
            Some(lease) if &lease.agent_id == agent_id => {}
            other => {
                return Err(CoordinationError::NotHolder {
                    resource_id: resource_id.clone(),
                    agent_id: agent_id.clone(),
                    holder: other.map(|lease| lease.agent_id.clone()),
                });
            }
        }

        self.release_locked(&mut table, resource_id, None);
        Ok(())
    }

    /// Release exactly this lease. Fails with `NotHolder` if the lease was
    /// already released or force-released.
    pub fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut table = self.shared.table.lock();
        let current = table
            .resources
            .get(&lease.resource_id)
            .and_then(|entry| entry.holder.as_ref());

        if current.map(|held| held.lease_id) != Some(lease.lease_id) {
            return Err(CoordinationError::NotHolder {
                resource_id: lease.resource_id.clone(),
                agent_id: lease.agent_id.clone(),
                holder: current.map(|held| held.agent_id.clone()),
            });
        }

        self.release_locked(&mut table, &lease.resource_id, None);
        Ok(())
    }

    /// Stale holder cleanup: force-release everything `agent_id` holds and
    /// fail its pending requests with `HolderLost`.
    pub fn release_all(&self, agent_id: &AgentId, reason: &str) -> Vec<ResourceId> {
        let mut table = self.shared.table.lock();

        let held: Vec<ResourceId> = table
            .resources
            .iter()
            .filter(|(_, entry)| {
                entry
                    .holder
                    .as_ref()
                    .is_some_and(|lease| &lease.agent_id == agent_id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut failed_waiters = Vec::new();
        for (resource_id, entry) in table.resources.iter_mut() {
            let mut index = 0;
            while index < entry.queue.len() {
                if &entry.queue[index].agent_id == agent_id {
                    failed_waiters.push((resource_id.clone(), entry.queue.remove(index)));
                } else {
                    index += 1;
                }
            }
        }

        for (resource_id, waiter) in failed_waiters {
            let _ = waiter.sender.send(Err(CoordinationError::HolderLost {
                resource_id,
                agent_id: agent_id.clone(),
            }));
        }

        for resource_id in &held {
            warn!(
                resource_id = %resource_id,
                agent_id = %agent_id,
                reason = %reason,
                "Force-releasing resource held by lost agent"
            );
            self.release_locked(&mut table, resource_id, Some(reason));
        }
        table.resources.retain(|_, entry| !entry.is_idle());

        held
    }

    /// Find wait-for cycles and abort one victim per cycle until none
    /// remain. The victim is the lowest-priority waiting request on the
    /// cycle, earliest request on ties.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockReport> {
        let mut reports = Vec::new();
        let mut table = self.shared.table.lock();

        while let Some(cycle) = find_cycle(&table) {
            // Each edge on the cycle is one waiting request; pick the victim
            let victim = cycle
                .iter()
                .min_by(|a, b| a.priority.cmp(&b.priority).then(a.sequence.cmp(&b.sequence)))
                .cloned();
            let Some(victim) = victim else {
                break;
            };

            let agents: Vec<AgentId> = cycle.iter().map(|edge| edge.waiter.clone()).collect();
            let resources: Vec<ResourceId> =
                cycle.iter().map(|edge| edge.resource_id.clone()).collect();

            let removed = table
                .resources
                .get_mut(&victim.resource_id)
                .and_then(|entry| entry.remove_waiter(victim.sequence));
            let Some(waiter) = removed else {
                // The edge came from this table a moment ago
                error!(
                    sequence = victim.sequence,
                    resource_id = %victim.resource_id,
                    "Deadlock victim request vanished from the wait queue"
                );
                break;
            };

            warn!(
                victim = %victim.waiter,
                resource_id = %victim.resource_id,
                cycle = ?agents,
                "Deadlock detected, aborting victim request"
            );
            let _ = waiter.sender.send(Err(CoordinationError::DeadlockDetected {
                resource_id: victim.resource_id.clone(),
                agent_id: victim.waiter.clone(),
                cycle: agents.clone(),
            }));

            self.shared.deadlocks_resolved.fetch_add(1, Ordering::Relaxed);
            self.shared.events.emit(CoordinationEvent::DeadlockDetected {
                cycle: agents.clone(),
                resources: resources.clone(),
                victim: victim.waiter.clone(),
            });

            reports.push(DeadlockReport {
                cycle: agents,
                resources,
                victim: victim.waiter,
                victim_task: waiter.task_id,
                victim_resource: victim.resource_id,
            });
        }

        reports
    }

    pub fn holder_of(&self, resource_id: &ResourceId) -> Option<AgentId> {
        self.shared
            .table
            .lock()
            .resources
            .get(resource_id)
            .and_then(|entry| entry.holder.as_ref())
            .map(|lease| lease.agent_id.clone())
    }

    pub fn queue_len(&self, resource_id: &ResourceId) -> usize {
        self.shared
            .table
            .lock()
            .resources
            .get(resource_id)
            .map_or(0, |entry| entry.queue.len())
    }

    /// Requests waiting across all resources
    pub fn pending_requests(&self) -> usize {
        self.shared
            .table
            .lock()
            .resources
            .values()
            .map(|entry| entry.queue.len())
            .sum()
    }

    pub fn held_by(&self, agent_id: &AgentId) -> Vec<Lease> {
        self.shared
            .table
            .lock()
            .resources
            .values()
            .filter_map(|entry| entry.holder.as_ref())
            .filter(|lease| &lease.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        self.shared
            .table
            .lock()
            .resources
            .iter()
            .map(|(resource_id, entry)| ResourceSnapshot {
                resource_id: resource_id.clone(),
                holder: entry.holder.as_ref().map(|lease| lease.agent_id.clone()),
                holder_task: entry.holder.as_ref().and_then(|lease| lease.task_id.clone()),
                acquired_at: entry.holder.as_ref().map(|lease| lease.acquired_at),
                waiters: entry
                    .queue
                    .iter()
                    .map(|waiter| WaiterSnapshot {
                        agent_id: waiter.agent_id.clone(),
                        task_id: waiter.task_id.clone(),
                        priority: waiter.priority,
                        requested_at: waiter.requested_at,
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn deadlocks_resolved(&self) -> u64 {
        self.shared.deadlocks_resolved.load(Ordering::Relaxed)
    }

    /// Clear the holder of `resource_id` and hand it to the next waiter
    fn release_locked(
        &self,
        table: &mut ResourceTable,
        resource_id: &ResourceId,
        lost_reason: Option<&str>,
    ) {
        let Some(entry) = table.resources.get_mut(resource_id) else {
            return;
        };
        let Some(previous) = entry.holder.take() else {
            return;
        };

        match lost_reason {
            Some(reason) => self.shared.events.emit(CoordinationEvent::HolderLost {
                resource_id: resource_id.clone(),
                agent_id: previous.agent_id.clone(),
                reason: reason.to_string(),
            }),
            None => {
                debug!(resource_id = %resource_id, agent_id = %previous.agent_id, "Resource released");
                self.shared.events.emit(CoordinationEvent::ResourceReleased {
                    resource_id: resource_id.clone(),
                    agent_id: previous.agent_id.clone(),
                });
            }
        }

        self.grant_next(table, resource_id);
    }

    /// Grant the resource to the highest-priority live waiter, if free
    fn grant_next(&self, table: &mut ResourceTable, resource_id: &ResourceId) {
        loop {
            let Some(entry) = table.resources.get_mut(resource_id) else {
                return;
            };
            if entry.holder.is_some() {
                error!(resource_id = %resource_id, "Attempted to grant a resource that is still held");
                return;
            }
            if entry.queue.is_empty() {
                table.resources.remove(resource_id);
                return;
            }

            let waiter = entry.queue.remove(0);
            let others: Vec<ContentionParticipant> = entry
                .queue
                .iter()
                .filter(|other| other.agent_id != waiter.agent_id)
                .map(Waiter::participant)
                .collect();

            let lease = table.new_lease(resource_id, &waiter.agent_id, waiter.task_id.clone());
            let waited_ms = waiter.enqueued.elapsed().as_millis() as u64;
            let winner = waiter.participant();

            if let Some(entry) = table.resources.get_mut(resource_id) {
                entry.holder = Some(lease.clone());
            }

            if waiter.sender.send(Ok(lease)).is_err() {
                // Receiver is gone; undo and try the next waiter
                if let Some(entry) = table.resources.get_mut(resource_id) {
                    entry.holder = None;
                }
                continue;
            }

            info!(
                resource_id = %resource_id,
                agent_id = %winner.agent_id,
                waited_ms,
                "Resource granted to waiter"
            );
            self.shared.events.emit(CoordinationEvent::ResourceAcquired {
                resource_id: resource_id.clone(),
                agent_id: winner.agent_id.clone(),
                waited_ms,
            });

            if !others.is_empty() {
                self.report_contention(resource_id, winner, others);
            }
            return;
        }
    }

    fn report_contention(
        &self,
        resource_id: &ResourceId,
        winner: ContentionParticipant,
        others: Vec<ContentionParticipant>,
    ) {
        let Some(sender) = &self.shared.contention else {
            return;
        };
        let winner_id = winner.agent_id.clone();
        let mut participants = vec![winner];
        participants.extend(others);
        let report = ContentionReport {
            resource_id: resource_id.clone(),
            participants,
            winner: winner_id,
        };
        if let Err(e) = sender.try_send(report) {
            debug!(resource_id = %resource_id, "Contention report dropped: {}", e);
        }
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.table.lock();
        f.debug_struct("ResourceManager")
            .field("resources", &table.resources.len())
            .field("deadlocks_resolved", &self.deadlocks_resolved())
            .finish()
    }
}

/// A queued acquire. Dropping it before it resolves withdraws the request,
/// or releases a grant that raced with the drop.
struct PendingAcquire {
    manager: ResourceManager,
    resource_id: ResourceId,
    sequence: u64,
    receiver: Option<oneshot::Receiver<Result<Lease>>>,
}

impl PendingAcquire {
    async fn wait(&mut self, request: &ResourceRequest) -> Result<Lease> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(CoordinationError::internal("acquire awaited twice"));
        };

        match tokio::time::timeout(request.timeout, receiver).await {
            Ok(Ok(result)) => {
                self.receiver = None;
                result
            }
            Ok(Err(_)) => {
                self.receiver = None;
                Err(CoordinationError::internal(format!(
                    "grant channel for {} closed without an answer",
                    self.resource_id
                )))
            }
            Err(_) => {
                let mut table = self.manager.shared.table.lock();
                let removed = table
                    .resources
                    .get_mut(&self.resource_id)
                    .and_then(|entry| entry.remove_waiter(self.sequence));
                if removed.is_some() {
                    self.receiver = None;
                    debug!(
                        resource_id = %request.resource_id,
                        agent_id = %request.agent_id,
                        "Resource request timed out"
                    );
                    return Err(CoordinationError::ResourceTimeout {
                        resource_id: request.resource_id.clone(),
                        agent_id: request.agent_id.clone(),
                        waited_ms: request.timeout.as_millis() as u64,
                    });
                }
                drop(table);

                // Answered between the timeout firing and taking the lock
                match self.receiver.take().map(|mut rx| rx.try_recv()) {
                    Some(Ok(result)) => result,
                    _ => Err(CoordinationError::internal(format!(
                        "request {} for {} disappeared",
                        self.sequence, self.resource_id
                    ))),
                }
            }
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };

        let mut table = self.manager.shared.table.lock();
        let removed = table
            .resources
            .get_mut(&self.resource_id)
            .and_then(|entry| entry.remove_waiter(self.sequence));
        if removed.is_some() {
            if table
                .resources
                .get(&self.resource_id)
                .is_some_and(|entry| entry.is_idle())
            {
                table.resources.remove(&self.resource_id);
            }
            return;
        }

        if let Ok(Ok(lease)) = receiver.try_recv() {
            let still_held = table
                .resources
                .get(&lease.resource_id)
                .and_then(|entry| entry.holder.as_ref())
                .is_some_and(|held| held.lease_id == lease.lease_id);
            if still_held {
                debug!(resource_id = %lease.resource_id, "Releasing grant for withdrawn request");
                self.manager.release_locked(&mut table, &lease.resource_id, None);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct WaitEdge {
    waiter: AgentId,
    holder: AgentId,
    resource_id: ResourceId,
    priority: Priority,
    sequence: u64,
}

/// First cycle in the wait-for graph, as the list of edges along it.
/// Agents and edges are visited in sorted order so the result is stable.
fn find_cycle(table: &ResourceTable) -> Option<Vec<WaitEdge>> {
    let mut graph: BTreeMap<AgentId, Vec<WaitEdge>> = BTreeMap::new();
    for (resource_id, entry) in &table.resources {
        let Some(holder) = entry.holder.as_ref() else {
            continue;
        };
        for waiter in &entry.queue {
            // An agent queued behind itself waits in order, not in a cycle
            if waiter.agent_id == holder.agent_id {
                continue;
            }
            graph.entry(waiter.agent_id.clone()).or_default().push(WaitEdge {
                waiter: waiter.agent_id.clone(),
                holder: holder.agent_id.clone(),
                resource_id: resource_id.clone(),
                priority: waiter.priority,
                sequence: waiter.sequence,
            });
        }
    }

    let mut finished: HashSet<AgentId> = HashSet::new();
    for start in graph.keys() {
        if finished.contains(start) {
            continue;
        }
        let mut path: Vec<WaitEdge> = Vec::new();
        let mut on_path: BTreeSet<AgentId> = BTreeSet::new();
        if let Some(cycle) = visit(start, &graph, &mut path, &mut on_path, &mut finished) {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    agent: &AgentId,
    graph: &BTreeMap<AgentId, Vec<WaitEdge>>,
    path: &mut Vec<WaitEdge>,
    on_path: &mut BTreeSet<AgentId>,
    finished: &mut HashSet<AgentId>,
) -> Option<Vec<WaitEdge>> {
    on_path.insert(agent.clone());

    for edge in graph.get(agent).map(Vec::as_slice).unwrap_or_default() {
        if on_path.contains(&edge.holder) {
            let start = path
                .iter()
                .position(|e| e.waiter == edge.holder)
                .unwrap_or(path.len());
            let mut cycle: Vec<WaitEdge> = path[start..].to_vec();
            cycle.push(edge.clone());
            return Some(cycle);
        }
        if finished.contains(&edge.holder) {
            continue;
        }
        path.push(edge.clone());
        if let Some(cycle) = visit(&edge.holder, graph, path, on_path, finished) {
            return Some(cycle);
        }
        path.pop();
    }

    on_path.remove(agent);
    finished.insert(agent.clone());
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);

    fn manager() -> ResourceManager {
        ResourceManager::new(EventBus::new(256))
    }

    #[tokio::test]
    async fn test_free_resource_granted_immediately() {
        let resources = manager();
        let lease = resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();
        assert_eq!(lease.agent_id, AgentId::new("a1"));
        assert_eq!(resources.holder_of(&ResourceId::new("db")), Some(AgentId::new("a1")));
    }

    #[tokio::test]
    async fn test_grant_on_a_held_resource_keeps_the_holder() {
        let resources = manager();
        let id = ResourceId::new("db");
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();

        {
            let mut table = resources.shared.table.lock();
            resources.grant_next(&mut table, &id);
        }
        assert_eq!(resources.holder_of(&id), Some(AgentId::new("a1")));
        resources.release(&id, &AgentId::new("a1")).unwrap();
        assert_eq!(resources.holder_of(&id), None);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_fails() {
        let resources = manager();
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();
        let err = resources
            .release(&ResourceId::new("db"), &AgentId::new("a2"))
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::NotHolder { holder: Some(ref h), .. } if h == &AgentId::new("a1")
        ));

        let err = resources
            .release(&ResourceId::new("free"), &AgentId::new("a1"))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotHolder { holder: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let resources = manager();
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();

        let err = resources
            .acquire(ResourceRequest::new("db", "a2", 5, Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ResourceTimeout { .. }));
        assert_eq!(resources.queue_len(&ResourceId::new("db")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_is_withdrawn() {
        let resources = manager();
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();

        let waiting = {
            let resources = resources.clone();
            tokio::spawn(async move {
                resources
                    .acquire(ResourceRequest::new("db", "a2", 5, LONG))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(resources.queue_len(&ResourceId::new("db")), 1);

        waiting.abort();
        let _ = waiting.await;
        assert_eq!(resources.queue_len(&ResourceId::new("db")), 0);

        resources
            .release(&ResourceId::new("db"), &AgentId::new("a1"))
            .unwrap();
        assert_eq!(resources.holder_of(&ResourceId::new("db")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_reports_holder_lost() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let resources = ResourceManager::new(events);
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();
        resources
            .acquire(ResourceRequest::new("cache", "a1", 5, LONG))
            .await
            .unwrap();

        let released = resources.release_all(&AgentId::new("a1"), "agent offline");
        assert_eq!(released, vec![ResourceId::new("cache"), ResourceId::new("db")]);
        assert!(resources.held_by(&AgentId::new("a1")).is_empty());

        let lost = rx
            .drain()
            .into_iter()
            .filter(|e| e.name() == "holder_lost")
            .count();
        assert_eq!(lost, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_agent_waiting_on_itself_is_not_a_deadlock() {
        let resources = manager();
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();
        let second = {
            let resources = resources.clone();
            tokio::spawn(async move {
                resources
                    .acquire(ResourceRequest::new("db", "a1", 5, LONG).for_task("t2"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(resources.detect_deadlocks().is_empty());
        resources
            .release(&ResourceId::new("db"), &AgentId::new("a1"))
            .unwrap();
        let lease = second.await.unwrap().unwrap();
        assert_eq!(lease.task_id, Some(TaskId::new("t2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_is_reported_on_handoff() {
        let (tx, mut reports) = mpsc::channel(8);
        let resources = ResourceManager::with_contention_channel(EventBus::new(64), tx);
        resources
            .acquire(ResourceRequest::new("db", "a1", 5, LONG))
            .await
            .unwrap();

        let mut waiters = Vec::new();
        for (agent, priority) in [("a2", 5), ("a3", 10)] {
            let resources = resources.clone();
            waiters.push(tokio::spawn(async move {
                resources
                    .acquire(ResourceRequest::new("db", agent, priority, LONG))
                    .await
            }));
            tokio::task::yield_now().await;
        }

        resources
            .release(&ResourceId::new("db"), &AgentId::new("a1"))
            .unwrap();
        let report = reports.try_recv().unwrap();
        assert_eq!(report.winner, AgentId::new("a3"));
        assert_eq!(report.participants.len(), 2);
        assert_eq!(report.participants[1].agent_id, AgentId::new("a2"));
    }
}
