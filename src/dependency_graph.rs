//! Dependency Graph Manager
//!
//! Directed acyclic graph of task ids where an edge `dep -> task` means
//! "`dep` must complete before `task`". Acyclicity is enforced when edges
//! are inserted; the graph is never repaired after the fact. Ordering
//! ties are always broken by insertion order so results are reproducible.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;

use crate::error::{CoordinationError, Result};
use crate::types::TaskId;

/// Progress of a node as far as its dependents are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Not finished yet
    Waiting,
    Completed,
    /// Failed or cancelled for good; dependents can never run
    Abandoned,
}

#[derive(Debug, Clone)]
struct Node {
    dependencies: BTreeSet<TaskId>,
    dependents: BTreeSet<TaskId>,
    state: NodeState,
    seq: u64,
    estimated_duration: Duration,
}

/// Longest dependency chain by estimated duration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CriticalPath {
    pub tasks: Vec<TaskId>,
    pub total_duration: Duration,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,
    /// Completed tasks that have been pruned; still satisfy dependencies
    retired: HashSet<TaskId>,
    /// `retired` in the order the ids were retired
    retired_order: VecDeque<TaskId>,
    next_seq: u64,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn state(&self, id: &TaskId) -> Option<NodeState> {
        self.nodes.get(id).map(|node| node.state)
    }

    /// Insert a task with its dependencies. Returns `true` when every
    /// dependency is already complete. On error the graph is unchanged.
    pub fn add_task(
        &mut self,
        id: &TaskId,
        dependencies: &BTreeSet<TaskId>,
        estimated_duration: Duration,
    ) -> Result<bool> {
        if self.nodes.contains_key(id) || self.retired.contains(id) {
            return Err(CoordinationError::DuplicateTask(id.clone()));
        }

        if dependencies.contains(id) {
            return Err(CoordinationError::CycleDetected {
                task_id: id.clone(),
                cycle: vec![id.clone(), id.clone()],
            });
        }

        for dep in dependencies {
            match self.nodes.get(dep) {
                Some(node) if node.state == NodeState::Abandoned => {
                    return Err(CoordinationError::DependencyFailed {
                        task_id: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                Some(_) => {}
                None if self.retired.contains(dep) => {}
                None => {
                    return Err(CoordinationError::DependencyNotFound {
                        task_id: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // A brand-new id has no incoming edges yet, but keep the check so
        // the invariant does not rest on that assumption.
        for dep in dependencies {
            if let Some(path) = self.path_between(dep, id) {
                return Err(CoordinationError::CycleDetected {
                    task_id: id.clone(),
                    cycle: cycle_from_path(id, path),
                });
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        for dep in dependencies {
            if let Some(node) = self.nodes.get_mut(dep) {
                node.dependents.insert(id.clone());
            }
        }

        self.nodes.insert(
            id.clone(),
            Node {
                dependencies: dependencies.clone(),
                dependents: BTreeSet::new(),
                state: NodeState::Waiting,
                seq,
                estimated_duration,
            },
        );

        Ok(self.is_satisfied(id))
    }

    /// Add a `dependency -> task` edge to an existing task. Rejected with
    /// `CycleDetected` if `dependency` already (transitively) depends on
    /// `task`.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId) -> Result<()> {
        let Some(node) = self.nodes.get(task) else {
            return Err(CoordinationError::TaskNotFound(task.clone()));
        };
        if node.state != NodeState::Waiting {
            return Err(CoordinationError::InvalidRequest(format!(
                "cannot add a dependency to finished task {task}"
            )));
        }
        if node.dependencies.contains(dependency) {
            return Ok(());
        }

        if task == dependency {
            return Err(CoordinationError::CycleDetected {
                task_id: task.clone(),
                cycle: vec![task.clone(), task.clone()],
            });
        }

        match self.nodes.get(dependency) {
            Some(dep) if dep.state == NodeState::Abandoned => {
                return Err(CoordinationError::DependencyFailed {
                    task_id: task.clone(),
                    dependency: dependency.clone(),
                });
            }
            Some(_) => {}
            None if self.retired.contains(dependency) => {}
            None => {
                return Err(CoordinationError::DependencyNotFound {
                    task_id: task.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        if let Some(path) = self.path_between(dependency, task) {
            return Err(CoordinationError::CycleDetected {
                task_id: task.clone(),
                cycle: cycle_from_path(task, path),
            });
        }

        if let Some(dep) = self.nodes.get_mut(dependency) {
            dep.dependents.insert(task.clone());
        }
        if let Some(node) = self.nodes.get_mut(task) {
            node.dependencies.insert(dependency.clone());
        }
        Ok(())
    }

    /// Follow dependency edges from `from` looking for `to`. Returns the
    /// path `from .. to` when reachable.
    fn path_between(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        let mut stack = vec![(from.clone(), vec![from.clone()])];
        let mut visited = HashSet::new();

        while let Some((current, path)) = stack.pop() {
            if &current == to {
                return Some(path);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                // Reverse so the lowest id is explored first
                for dep in node.dependencies.iter().rev() {
                    if !visited.contains(dep) {
                        let mut next = path.clone();
                        next.push(dep.clone());
                        stack.push((dep.clone(), next));
                    }
                }
            }
        }
        None
    }

    /// True when every dependency of `id` has completed
    pub fn is_satisfied(&self, id: &TaskId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        node.dependencies.iter().all(|dep| self.dependency_done(dep))
    }

    fn dependency_done(&self, dep: &TaskId) -> bool {
        match self.nodes.get(dep) {
            Some(node) => node.state == NodeState::Completed,
            None => self.retired.contains(dep),
        }
    }

    /// Dependencies of `id` that have not completed yet
    pub fn unmet_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.nodes
            .get(id)
            .map(|node| {
                node.dependencies
                    .iter()
                    .filter(|dep| !self.dependency_done(dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.nodes
            .get(id)
            .map(|node| self.in_insertion_order(node.dependents.iter().cloned()))
            .unwrap_or_default()
    }

    /// Mark `id` complete and return the direct dependents that became
    /// ready because of it, in insertion order.
    pub fn mark_completed(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))?;
        if node.state == NodeState::Abandoned {
            return Err(CoordinationError::internal(format!(
                "task {id} completed after being abandoned"
            )));
        }
        node.state = NodeState::Completed;
        let dependents: Vec<TaskId> = node.dependents.iter().cloned().collect();

        let ready = dependents
            .into_iter()
            .filter(|dependent| {
                self.nodes
                    .get(dependent)
                    .is_some_and(|n| n.state == NodeState::Waiting)
                    && self.is_satisfied(dependent)
            })
            .collect::<Vec<_>>();

        Ok(self.in_insertion_order(ready.into_iter()))
    }

    /// Mark `id` as never going to complete. Every waiting task that
    /// depends on it, directly or transitively, is abandoned too and
    /// returned in insertion order.
    pub fn mark_abandoned(&mut self, id: &TaskId) -> Vec<TaskId> {
        let mut affected = Vec::new();
        let mut queue = VecDeque::new();

        if let Some(node) = self.nodes.get_mut(id) {
            if node.state == NodeState::Completed {
                return affected;
            }
            node.state = NodeState::Abandoned;
            queue.extend(node.dependents.iter().cloned());
        }

        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.state != NodeState::Waiting {
                continue;
            }
            node.state = NodeState::Abandoned;
            queue.extend(node.dependents.iter().cloned());
            affected.push(current);
        }

        self.in_insertion_order(affected.into_iter())
    }

    /// Remove a task and its edges. Rejected while any dependent is still
    /// waiting on it.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<()> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.clone()))?;

        let waiting: Vec<TaskId> = node
            .dependents
            .iter()
            .filter(|dependent| {
                self.nodes
                    .get(*dependent)
                    .is_some_and(|n| n.state == NodeState::Waiting)
            })
            .cloned()
            .collect();
        if !waiting.is_empty() {
            return Err(CoordinationError::TaskHasDependents {
                task_id: id.clone(),
                dependents: self.in_insertion_order(waiting.into_iter()),
            });
        }

        let Some(node) = self.nodes.remove(id) else {
            return Ok(());
        };
        for dep in &node.dependencies {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.dependents.remove(id);
            }
        }
        // Finished dependents keep the id in their dependency set; a
        // completed node stays resolvable through `retired`.
        if node.state == NodeState::Completed && self.retired.insert(id.clone()) {
            self.retired_order.push_back(id.clone());
        }
        Ok(())
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Forget the oldest retired ids until at most `keep` remain. Ids a
    /// remaining node still depends on are kept regardless. Returns how
    /// many were forgotten.
    pub fn trim_retired(&mut self, keep: usize) -> usize {
        if self.retired.len() <= keep {
            return 0;
        }
        let referenced: HashSet<TaskId> = self
            .nodes
            .values()
            .flat_map(|node| node.dependencies.iter())
            .filter(|dep| self.retired.contains(*dep))
            .cloned()
            .collect();

        let mut excess = self.retired.len() - keep;
        let mut remaining = VecDeque::with_capacity(self.retired_order.len());
        let mut forgotten = 0;
        while let Some(id) = self.retired_order.pop_front() {
            if excess > 0 && !referenced.contains(&id) {
                self.retired.remove(&id);
                excess -= 1;
                forgotten += 1;
            } else {
                remaining.push_back(id);
            }
        }
        self.retired_order = remaining;
        forgotten
    }

    /// Deterministic execution order; ties go to the earliest inserted task.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: HashMap<&TaskId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let degree = node
                    .dependencies
                    .iter()
                    .filter(|dep| self.nodes.contains_key(*dep))
                    .count();
                (id, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(u64, &TaskId)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse((self.nodes[*id].seq, *id)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id.clone());
            for dependent in &self.nodes[id].dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.nodes[dependent].seq, dependent)));
                    }
                }
            }
        }

        order
    }

    /// Longest chain by summed estimated duration. Visibility only.
    pub fn critical_path(&self) -> CriticalPath {
        let order = self.topological_order();
        let mut best: HashMap<&TaskId, (Duration, Option<&TaskId>)> = HashMap::new();

        for id in &order {
            let node = &self.nodes[id];
            let mut predecessor: Option<&TaskId> = None;
            let mut longest = Duration::ZERO;
            for dep in &node.dependencies {
                let Some((dep_total, _)) = best.get(dep) else {
                    continue;
                };
                let better = *dep_total > longest
                    || (*dep_total == longest
                        && predecessor.map_or(true, |p| self.nodes[dep].seq < self.nodes[p].seq));
                if better {
                    longest = *dep_total;
                    predecessor = Some(dep);
                }
            }
            best.insert(id, (longest + node.estimated_duration, predecessor));
        }

        let Some(end) = order.iter().fold(None::<&TaskId>, |acc, id| match acc {
            Some(current) if best[current].0 >= best[id].0 => Some(current),
            _ => Some(id),
        }) else {
            return CriticalPath::default();
        };

        let total_duration = best[end].0;
        let mut tasks = vec![end.clone()];
        let mut cursor = best[end].1;
        while let Some(id) = cursor {
            tasks.push(id.clone());
            cursor = best[id].1;
        }
        tasks.reverse();

        CriticalPath {
            tasks,
            total_duration,
        }
    }

    fn in_insertion_order(&self, ids: impl Iterator<Item = TaskId>) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = ids.collect();
        ids.sort_by_key(|id| self.nodes.get(id).map(|n| n.seq).unwrap_or(u64::MAX));
        ids
    }
}

/// `path` runs from the proposed dependency back to `task`; the cycle
/// reads `task -> dependency -> ... -> task`.
fn cycle_from_path(task: &TaskId, path: Vec<TaskId>) -> Vec<TaskId> {
    let mut cycle = Vec::with_capacity(path.len() + 1);
    cycle.push(task.clone());
    cycle.extend(path);
    cycle
}
