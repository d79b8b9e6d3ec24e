//! Work-Stealing Load Balancer
//!
//! A pure planner: given a snapshot of agent loads it proposes moving
//! not-yet-started tasks from overloaded agents to underloaded ones. The
//! scheduler re-validates and applies the proposals.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::config::WorkStealingConfig;
use crate::types::{AgentId, TaskId};

/// A task assigned to an agent but not handed to its executor yet
#[derive(Debug, Clone, PartialEq)]
pub struct StealCandidate {
    pub task_id: TaskId,
    pub required_capabilities: BTreeSet<String>,
    /// Larger is newer
    pub assigned_seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentLoad {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: usize,
    /// All tasks currently held, started or not
    pub current_tasks: usize,
    /// The not-yet-started subset of `current_tasks`
    pub backlog: Vec<StealCandidate>,
    /// Eligible to receive work (active with a closed circuit)
    pub accepting: bool,
}

impl AgentLoad {
    pub fn load_ratio(&self) -> f64 {
        self.current_tasks as f64 / self.max_concurrent_tasks.max(1) as f64
    }
}

/// Agents in registration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSnapshot {
    pub agents: Vec<AgentLoad>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StealProposal {
    pub task_id: TaskId,
    pub from: AgentId,
    pub to: AgentId,
    /// Donor ratio minus recipient ratio when the move was planned
    pub differential: f64,
}

#[derive(Debug, Clone)]
pub struct WorkStealer {
    config: WorkStealingConfig,
}

impl WorkStealer {
    pub fn new(config: WorkStealingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkStealingConfig {
        &self.config
    }

    /// Plan at most `max_steal_batch` moves. Each step takes the
    /// donor/recipient pair with the largest load differential that has a
    /// movable task, and moves the donor's newest compatible task.
    pub fn plan(&self, snapshot: &LoadSnapshot) -> Vec<StealProposal> {
        if !self.config.enabled || self.config.max_steal_batch == 0 {
            return Vec::new();
        }

        let mut loads: Vec<usize> = snapshot.agents.iter().map(|a| a.current_tasks).collect();
        let mut moved: HashSet<TaskId> = HashSet::new();
        let mut proposals = Vec::new();

        let ratio = |index: usize, loads: &[usize]| {
            loads[index] as f64 / snapshot.agents[index].max_concurrent_tasks.max(1) as f64
        };

        while proposals.len() < self.config.max_steal_batch {
            let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
            for d in 0..snapshot.agents.len() {
                if ratio(d, &loads) <= self.config.high_water {
                    continue;
                }
                for (r, recipient) in snapshot.agents.iter().enumerate() {
                    if r == d || !recipient.accepting {
                        continue;
                    }
                    if ratio(r, &loads) >= self.config.low_water
                        || loads[r] >= recipient.max_concurrent_tasks
                    {
                        continue;
                    }
                    let differential = ratio(d, &loads) - ratio(r, &loads);
                    pairs.push((differential, d, r));
                }
            }

            // Largest differential first, then registration order
            pairs.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });

            let next = pairs.into_iter().find_map(|(differential, d, r)| {
                let recipient = &snapshot.agents[r];
                snapshot.agents[d]
                    .backlog
                    .iter()
                    .filter(|task| !moved.contains(&task.task_id))
                    .filter(|task| task.required_capabilities.is_subset(&recipient.capabilities))
                    .max_by_key(|task| task.assigned_seq)
                    .map(|task| (differential, d, r, task.task_id.clone()))
            });

            let Some((differential, d, r, task_id)) = next else {
                break;
            };

            loads[d] -= 1;
            loads[r] += 1;
            moved.insert(task_id.clone());
            proposals.push(StealProposal {
                task_id,
                from: snapshot.agents[d].agent_id.clone(),
                to: snapshot.agents[r].agent_id.clone(),
                differential,
            });
        }

        proposals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, seq: u64, caps: &[&str]) -> StealCandidate {
        StealCandidate {
            task_id: TaskId::new(id),
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            assigned_seq: seq,
        }
    }

    fn agent(id: &str, max: usize, current: usize, backlog: Vec<StealCandidate>) -> AgentLoad {
        AgentLoad {
            agent_id: AgentId::new(id),
            capabilities: ["rust".to_string()].into_iter().collect(),
            max_concurrent_tasks: max,
            current_tasks: current,
            backlog,
            accepting: true,
        }
    }

    fn stealer(batch: usize) -> WorkStealer {
        WorkStealer::new(WorkStealingConfig {
            max_steal_batch: batch,
            ..Default::default()
        })
    }

    #[test]
    fn test_moves_newest_unstarted_task() {
        let snapshot = LoadSnapshot {
            agents: vec![
                agent(
                    "busy",
                    4,
                    4,
                    vec![candidate("old", 1, &[]), candidate("new", 7, &[])],
                ),
                agent("idle", 4, 0, vec![]),
            ],
        };
        let proposals = stealer(1).plan(&snapshot);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].task_id, TaskId::new("new"));
        assert_eq!(proposals[0].from, AgentId::new("busy"));
        assert_eq!(proposals[0].to, AgentId::new("idle"));
        assert_eq!(proposals[0].differential, 1.0);
    }

    #[test]
    fn test_respects_capabilities() {
        let snapshot = LoadSnapshot {
            agents: vec![
                agent("busy", 2, 2, vec![candidate("gpu-job", 1, &["gpu"])]),
                agent("idle", 2, 0, vec![]),
            ],
        };
        assert!(stealer(2).plan(&snapshot).is_empty());
    }

    #[test]
    fn test_batch_bounds_migrations() {
        let backlog = |prefix: &str| {
            (0..4)
                .map(|i| candidate(&format!("{prefix}{i}"), i, &[]))
                .collect::<Vec<_>>()
        };
        let snapshot = LoadSnapshot {
            agents: vec![
                agent("a", 4, 4, backlog("a")),
                agent("b", 4, 4, backlog("b")),
                agent("c", 8, 0, vec![]),
                agent("d", 8, 0, vec![]),
            ],
        };
        let proposals = stealer(2).plan(&snapshot);
        assert_eq!(proposals.len(), 2);
    }

    #[test]
    fn test_largest_differential_first() {
        let snapshot = LoadSnapshot {
            agents: vec![
                agent("mild", 10, 8, vec![candidate("m1", 1, &[])]),
                agent("severe", 2, 2, vec![candidate("s1", 2, &[])]),
                agent("idle", 10, 0, vec![]),
            ],
        };
        let proposals = stealer(1).plan(&snapshot);
        assert_eq!(proposals[0].task_id, TaskId::new("s1"));
    }

    #[test]
    fn test_running_only_agents_donate_nothing() {
        let snapshot = LoadSnapshot {
            agents: vec![agent("busy", 2, 2, vec![]), agent("idle", 2, 0, vec![])],
        };
        assert!(stealer(2).plan(&snapshot).is_empty());
    }

    #[test]
    fn test_non_accepting_recipient_is_skipped() {
        let mut offline = agent("offline", 4, 0, vec![]);
        offline.accepting = false;
        let snapshot = LoadSnapshot {
            agents: vec![agent("busy", 2, 2, vec![candidate("t", 1, &[])]), offline],
        };
        assert!(stealer(2).plan(&snapshot).is_empty());
    }
}
