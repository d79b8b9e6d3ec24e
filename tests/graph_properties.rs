//! Property tests for the dependency graph

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use swarm_coordinator::{CoordinationError, DependencyGraph, TaskId};

#[derive(Debug, Clone, Arbitrary)]
enum GraphOp {
    /// New task depending on a subset of the existing ones (by index)
    Add(
        #[proptest(strategy = "prop::collection::vec(any::<prop::sample::Index>(), 0..3)")]
        Vec<prop::sample::Index>,
    ),
    /// Edge between two existing tasks
    Link(prop::sample::Index, prop::sample::Index),
}

/// True when every edge of the graph points backwards in `order`
fn respects_dependencies(order: &[TaskId], edges: &[(TaskId, TaskId)]) -> bool {
    let position: HashMap<&TaskId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    edges
        .iter()
        .all(|(task, dep)| position[dep] < position[task])
}

proptest! {
    #[test]
    fn graph_never_contains_a_cycle(ops in prop::collection::vec(any::<GraphOp>(), 1..40)) {
        let mut graph = DependencyGraph::new();
        let mut ids: Vec<TaskId> = Vec::new();
        let mut edges: Vec<(TaskId, TaskId)> = Vec::new();

        for op in ops {
            match op {
                GraphOp::Add(picks) => {
                    let id = TaskId::new(format!("t{}", ids.len()));
                    let deps: BTreeSet<TaskId> = if ids.is_empty() {
                        BTreeSet::new()
                    } else {
                        picks.iter().map(|pick| pick.get(&ids).clone()).collect()
                    };
                    graph.add_task(&id, &deps, Duration::from_millis(10)).unwrap();
                    edges.extend(deps.into_iter().map(|dep| (id.clone(), dep)));
                    ids.push(id);
                }
                GraphOp::Link(a, b) => {
                    if ids.is_empty() {
                        continue;
                    }
                    let task = a.get(&ids).clone();
                    let dep = b.get(&ids).clone();
                    let before = graph.topological_order();
                    match graph.add_dependency(&task, &dep) {
                        Ok(()) => {
                            if !edges.contains(&(task.clone(), dep.clone())) {
                                edges.push((task, dep));
                            }
                        }
                        Err(CoordinationError::CycleDetected { cycle, .. }) => {
                            prop_assert!(cycle.len() >= 2);
                            prop_assert_eq!(graph.topological_order(), before);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {}", other),
                    }
                }
            }

            // A full topological order exists only for an acyclic graph
            let order = graph.topological_order();
            prop_assert_eq!(order.len(), ids.len());
            prop_assert!(respects_dependencies(&order, &edges));
        }
    }

    #[test]
    fn completing_in_topological_order_readies_everything(
        deps in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..25)
    ) {
        let mut graph = DependencyGraph::new();
        let mut ids: Vec<TaskId> = Vec::new();
        let mut ready: BTreeSet<TaskId> = BTreeSet::new();

        for picks in deps {
            let id = TaskId::new(format!("t{}", ids.len()));
            let deps: BTreeSet<TaskId> = if ids.is_empty() {
                BTreeSet::new()
            } else {
                picks.iter().map(|pick| pick.get(&ids).clone()).collect()
            };
            if graph.add_task(&id, &deps, Duration::ZERO).unwrap() {
                ready.insert(id.clone());
            }
            ids.push(id);
        }

        for id in graph.topological_order() {
            prop_assert!(ready.contains(&id), "{} completed before it was ready", id);
            ready.extend(graph.mark_completed(&id).unwrap());
        }
        prop_assert_eq!(ready.len(), ids.len());
    }
}
