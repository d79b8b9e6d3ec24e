//! Resource manager properties: exclusive holding, grant order and
//! deadlock resolution

use proptest::prelude::*;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use swarm_coordinator::{
    AgentId, CoordinationError, EventBus, Priority, ResourceId, ResourceManager, ResourceRequest,
};

const LONG: Duration = Duration::from_secs(3600);

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn one_holder_at_a_time_and_grants_follow_priority_then_arrival(
        requests in prop::collection::vec((-5i32..5, 0u64..50), 1..12)
    ) {
        let granted_order = paused_runtime().block_on(async {
            let manager = ResourceManager::new(EventBus::new(256));
            let resource = ResourceId::new("shared");
            let owner = manager
                .acquire(ResourceRequest::new(resource.clone(), "owner", 0, LONG))
                .await
                .unwrap();

            let held = Arc::new(AtomicBool::new(false));
            let (granted_tx, mut granted_rx) = mpsc::unbounded_channel();
            let mut handles = Vec::new();
            for (index, (priority, hold_ms)) in requests.iter().copied().enumerate() {
                let manager = manager.clone();
                let resource = resource.clone();
                let held = held.clone();
                let granted_tx = granted_tx.clone();
                handles.push(tokio::spawn(async move {
                    let agent = AgentId::new(format!("a{index}"));
                    let lease = manager
                        .acquire(ResourceRequest::new(resource.clone(), agent.clone(), priority, LONG))
                        .await
                        .unwrap();
                    assert!(!held.swap(true, Ordering::SeqCst), "two holders at once");
                    granted_tx.send(index).unwrap();
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    held.store(false, Ordering::SeqCst);
                    manager.release_lease(&lease).unwrap();
                }));
                // Enqueue in spawn order
                tokio::task::yield_now().await;
            }
            drop(granted_tx);
            assert_eq!(manager.queue_len(&resource), requests.len());

            manager.release_lease(&owner).unwrap();
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(manager.holder_of(&resource), None);

            let mut order = Vec::new();
            while let Some(index) = granted_rx.recv().await {
                order.push(index);
            }
            order
        });

        let mut expected: Vec<usize> = (0..requests.len()).collect();
        expected.sort_by_key(|&index| (Reverse(Priority(requests[index].0)), index));
        prop_assert_eq!(granted_order, expected);
    }

    #[test]
    fn wait_for_ring_loses_exactly_its_lowest_priority_member(n in 2usize..6) {
        paused_runtime().block_on(async move {
            let manager = ResourceManager::new(EventBus::new(256));
            let resource = |i: usize| ResourceId::new(format!("r{i}"));
            let agent = |i: usize| AgentId::new(format!("a{i}"));
            // a0 has the lowest priority on the ring
            let priority = |i: usize| Priority(i as i32 + 1);

            let mut owned = Vec::new();
            for i in 0..n {
                owned.push(
                    manager
                        .acquire(ResourceRequest::new(resource(i), agent(i), priority(i), LONG))
                        .await
                        .unwrap(),
                );
            }

            let mut waiting = Vec::new();
            for (i, own) in owned.into_iter().enumerate() {
                let manager = manager.clone();
                waiting.push(tokio::spawn(async move {
                    let next = (i + 1) % n;
                    let outcome = manager
                        .acquire(ResourceRequest::new(resource(next), agent(i), priority(i), LONG))
                        .await;
                    if let Ok(lease) = &outcome {
                        manager.release_lease(lease).unwrap();
                        manager.release_lease(&own).unwrap();
                    }
                    (own, outcome)
                }));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(manager.pending_requests(), n);

            let reports = manager.detect_deadlocks();
            assert_eq!(reports.len(), 1);
            let report = &reports[0];
            assert_eq!(report.victim, agent(0));
            assert_eq!(report.victim_resource, resource(1));
            assert_eq!(report.cycle.len(), n);
            assert!(manager.detect_deadlocks().is_empty());

            let mut waiting = waiting.into_iter();
            let (victim_lease, victim_outcome) = waiting.next().unwrap().await.unwrap();
            assert!(matches!(
                victim_outcome,
                Err(CoordinationError::DeadlockDetected { .. })
            ));

            // Once the victim backs off the rest of the ring drains
            manager.release_lease(&victim_lease).unwrap();
            for handle in waiting {
                let (_, outcome) = handle.await.unwrap();
                assert!(outcome.is_ok());
            }
            assert_eq!(manager.pending_requests(), 0);
            assert_eq!(manager.deadlocks_resolved(), 1);
        });
    }
}
