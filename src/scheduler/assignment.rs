// Assignment Strategies - match queued tasks to eligible agents
//
// Candidates arrive pre-filtered (active, spare capacity, capabilities
// satisfied, circuit closed) and in registration order, so every strategy
// breaks remaining ties by registration order simply by taking the first
// minimum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Agent, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategyKind {
    #[default]
    CapabilityBased,
    RoundRobin,
    LeastLoaded,
    Affinity,
}

impl fmt::Display for AssignmentStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AssignmentStrategyKind::CapabilityBased => "capability_based",
            AssignmentStrategyKind::RoundRobin => "round_robin",
            AssignmentStrategyKind::LeastLoaded => "least_loaded",
            AssignmentStrategyKind::Affinity => "affinity",
        };
        f.write_str(label)
    }
}

impl FromStr for AssignmentStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "capability_based" | "capability" => Ok(AssignmentStrategyKind::CapabilityBased),
            "round_robin" => Ok(AssignmentStrategyKind::RoundRobin),
            "least_loaded" => Ok(AssignmentStrategyKind::LeastLoaded),
            "affinity" => Ok(AssignmentStrategyKind::Affinity),
            other => Err(format!("unknown assignment strategy: {other}")),
        }
    }
}

pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `candidates` of the chosen agent
    fn select(&mut self, task: &Task, candidates: &[&Agent]) -> Option<usize>;
}

pub fn strategy_for(kind: AssignmentStrategyKind) -> Box<dyn AssignmentStrategy> {
    match kind {
        AssignmentStrategyKind::CapabilityBased => Box::new(CapabilityBased),
        AssignmentStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        AssignmentStrategyKind::LeastLoaded => Box::new(LeastLoaded),
        AssignmentStrategyKind::Affinity => Box::new(Affinity),
    }
}

/// Lowest load ratio, then lowest absolute load
#[derive(Debug, Default)]
pub struct CapabilityBased;

impl AssignmentStrategy for CapabilityBased {
    fn name(&self) -> &'static str {
        "capability_based"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Agent]) -> Option<usize> {
        lowest_ratio(candidates)
    }
}

#[derive(Debug, Default)]
pub struct LeastLoaded;

impl AssignmentStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Agent]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, agent)| agent.current_load())
            .map(|(i, _)| i)
    }
}

/// Rotates through agents in registration order, starting after the last
/// one picked
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<u64>,
}

impl AssignmentStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&mut self, _task: &Task, candidates: &[&Agent]) -> Option<usize> {
        let registered = |(_, agent): &(usize, &&Agent)| agent.registration_seq;

        let next = self.last.and_then(|last| {
            candidates
                .iter()
                .enumerate()
                .filter(|(_, agent)| agent.registration_seq > last)
                .min_by_key(registered)
        });
        // Wrap around after the most recently registered agent
        let (index, agent) = next.or_else(|| candidates.iter().enumerate().min_by_key(registered))?;

        self.last = Some(agent.registration_seq);
        Some(index)
    }
}

/// Prefer an agent whose last completed task had the same type
#[derive(Debug, Default)]
pub struct Affinity;

impl AssignmentStrategy for Affinity {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select(&mut self, task: &Task, candidates: &[&Agent]) -> Option<usize> {
        let warm: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, agent)| agent.last_completed_type.as_deref() == Some(task.task_type.as_str()))
            .map(|(i, _)| i)
            .collect();

        if warm.is_empty() {
            return lowest_ratio(candidates);
        }

        let subset: Vec<&Agent> = warm.iter().map(|&i| candidates[i]).collect();
        lowest_ratio(&subset).map(|i| warm[i])
    }
}

fn lowest_ratio(candidates: &[&Agent]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, agent) in candidates.iter().enumerate() {
        let better = match best {
            None => true,
            Some(b) => {
                let current = candidates[b];
                agent.load_ratio() < current.load_ratio()
                    || (agent.load_ratio() == current.load_ratio()
                        && agent.current_load() < current.current_load())
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentSpec, TaskId, TaskSpec};

    fn agent(id: &str, max: usize, load: usize) -> Agent {
        let mut agent =
            Agent::from_spec(AgentSpec::new(id).with_max_concurrent_tasks(max));
        agent.registration_seq = id.bytes().map(u64::from).sum();
        for i in 0..load {
            agent.current_tasks.insert(TaskId::new(format!("{id}-{i}")));
        }
        agent
    }

    fn task(task_type: &str) -> Task {
        Task::from_spec(TaskSpec::new(task_type, ""), 3)
    }

    #[test]
    fn test_capability_based_prefers_lowest_ratio() {
        let a = agent("a", 2, 1); // 0.5
        let b = agent("b", 10, 2); // 0.2
        let candidates = vec![&a, &b];
        assert_eq!(CapabilityBased.select(&task("build"), &candidates), Some(1));
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let a = agent("zeta", 2, 0);
        let b = agent("alpha", 2, 0);
        let candidates = vec![&a, &b];
        assert_eq!(CapabilityBased.select(&task("build"), &candidates), Some(0));
        assert_eq!(LeastLoaded.select(&task("build"), &candidates), Some(0));
    }

    #[test]
    fn test_least_loaded_ignores_capacity() {
        let a = agent("a", 10, 3);
        let b = agent("b", 2, 1);
        let candidates = vec![&a, &b];
        assert_eq!(LeastLoaded.select(&task("build"), &candidates), Some(1));
    }

    #[test]
    fn test_round_robin_rotates() {
        let a = agent("a", 5, 0);
        let b = agent("b", 5, 0);
        let c = agent("c", 5, 0);
        let candidates = vec![&a, &b, &c];
        let mut rr = RoundRobin::default();
        let picks: Vec<_> = (0..4)
            .map(|_| rr.select(&task("x"), &candidates))
            .collect();
        assert_eq!(picks, vec![Some(0), Some(1), Some(2), Some(0)]);
    }

    #[test]
    fn test_round_robin_skips_missing_candidates() {
        let a = agent("a", 5, 0);
        let c = agent("c", 5, 0);
        let mut rr = RoundRobin::default();
        let all = vec![&a, &c];
        assert_eq!(rr.select(&task("x"), &all), Some(0));
        // "a" is busy now; rotation continues past it
        let only_c = vec![&c];
        assert_eq!(rr.select(&task("x"), &only_c), Some(0));
        assert_eq!(rr.select(&task("x"), &all), Some(0));
    }

    #[test]
    fn test_round_robin_follows_registration_not_id() {
        let mut late = agent("alpha", 5, 0);
        late.registration_seq = 30;
        let mut early = agent("zeta", 5, 0);
        early.registration_seq = 10;
        let mut middle = agent("mu", 5, 0);
        middle.registration_seq = 20;
        let candidates = vec![&early, &middle, &late];
        let mut rr = RoundRobin::default();
        let picks: Vec<_> = (0..4)
            .map(|_| rr.select(&task("x"), &candidates).map(|i| candidates[i].id.to_string()))
            .collect();
        assert_eq!(
            picks,
            vec![
                Some("zeta".to_string()),
                Some("mu".to_string()),
                Some("alpha".to_string()),
                Some("zeta".to_string()),
            ]
        );
    }

    #[test]
    fn test_affinity_prefers_warm_agent() {
        let cold = agent("cold", 4, 0);
        let mut warm = agent("warm", 4, 2);
        warm.last_completed_type = Some("review".to_string());
        let candidates = vec![&cold, &warm];
        assert_eq!(Affinity.select(&task("review"), &candidates), Some(1));
        assert_eq!(Affinity.select(&task("build"), &candidates), Some(0));
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(CapabilityBased.select(&task("x"), &[]), None);
        assert_eq!(RoundRobin::default().select(&task("x"), &[]), None);
    }

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!(
            "least-loaded".parse::<AssignmentStrategyKind>().unwrap(),
            AssignmentStrategyKind::LeastLoaded
        );
        assert!("random".parse::<AssignmentStrategyKind>().is_err());
        assert_eq!(strategy_for(AssignmentStrategyKind::Affinity).name(), "affinity");
    }
}
