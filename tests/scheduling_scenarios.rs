//! End-to-end scheduling scenarios driven through the coordination manager
//! on a paused clock

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarm_coordinator::{
    AgentId, AgentSpec, CircuitState, CoordinationError, CoordinationEvent, Priority, ResourceId,
    ResourceRequest, TaskId, TaskSpec, TaskStatus,
};

mod fixtures;
use fixtures::*;

#[tokio::test(start_paused = true)]
async fn dependent_task_is_queued_only_after_its_dependency_completes() {
    let manager = started_manager(test_config());
    let mut events = manager.subscribe();

    manager
        .create_task(TaskSpec::new("compile", "").with_id("A").requires_capability("rust"))
        .await
        .unwrap();
    manager
        .create_task(
            TaskSpec::new("test", "")
                .with_id("B")
                .depends_on("A")
                .requires_capability("rust"),
        )
        .await
        .unwrap();
    manager
        .register_agent(AgentSpec::new("solo").with_capability("rust"), succeeding())
        .await
        .unwrap();

    let b = manager
        .wait_for_task(&TaskId::new("B"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(b.status, TaskStatus::Completed);

    let timeline: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            CoordinationEvent::TaskAssigned { task_id, .. } => Some(format!("assigned {task_id}")),
            CoordinationEvent::TaskCompleted { task_id, .. } => Some(format!("completed {task_id}")),
            CoordinationEvent::TaskStatusChanged {
                task_id,
                to: TaskStatus::Queued,
                ..
            } => Some(format!("queued {task_id}")),
            _ => None,
        })
        .collect();

    assert_eq!(
        timeline,
        vec![
            "queued A",
            "assigned A",
            "completed A",
            "queued B",
            "assigned B",
            "completed B",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn always_failing_task_retries_three_times_with_growing_delay() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 50;
    let manager = started_manager(config);
    let mut events = manager.subscribe();

    let calls = Arc::new(AtomicU32::new(0));
    manager
        .register_agent(AgentSpec::new("flaky"), counting(calls.clone(), false))
        .await
        .unwrap();
    let id = manager
        .create_task(TaskSpec::new("x", "").with_max_retries(3))
        .await
        .unwrap();

    let task = manager.wait_for_task(&id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(task
        .metadata_str("failure_reason")
        .unwrap()
        .contains("executor failure"));

    let mut statuses = Vec::new();
    let mut delays = Vec::new();
    for event in events.drain() {
        match event {
            CoordinationEvent::TaskStatusChanged { to, .. } => statuses.push(to),
            CoordinationEvent::TaskRetrying { delay_ms, .. } => delays.push(delay_ms),
            _ => {}
        }
    }

    let retries = statuses.iter().filter(|s| **s == TaskStatus::Retrying).count();
    let failures = statuses.iter().filter(|s| **s == TaskStatus::Failed).count();
    assert_eq!(retries, 3);
    assert_eq!(failures, 4);
    assert_eq!(statuses.last(), Some(&TaskStatus::Failed));
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
}

#[tokio::test(start_paused = true)]
async fn higher_priority_request_is_granted_first() {
    let manager = started_manager(test_config());
    for (id, priority) in [("owner", 1), ("p5", 5), ("p10", 10)] {
        manager
            .register_agent(AgentSpec::new(id).with_priority(Priority(priority)), succeeding())
            .await
            .unwrap();
    }

    let held = manager
        .acquire_resource("R", &AgentId::new("owner"), Priority(1), Duration::from_secs(5))
        .await
        .unwrap();

    let (granted_tx, mut granted) = tokio::sync::mpsc::unbounded_channel();
    for (agent, priority) in [("p5", 5), ("p10", 10)] {
        let manager = manager.clone();
        let granted_tx = granted_tx.clone();
        tokio::spawn(async move {
            let lease = manager
                .acquire_resource("R", &AgentId::new(agent), Priority(priority), Duration::from_secs(5))
                .await
                .unwrap();
            granted_tx.send(lease.agent_id.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.release_resource(&lease.resource_id, &lease.agent_id).unwrap();
        });
    }
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    manager.release_resource(&held.resource_id, &held.agent_id).unwrap();
    assert_eq!(granted.recv().await, Some(AgentId::new("p10")));
    assert_eq!(granted.recv().await, Some(AgentId::new("p5")));
}

#[tokio::test(start_paused = true)]
async fn failed_dependency_cancels_the_chain_with_a_reason() {
    let manager = started_manager(test_config());
    manager
        .register_agent(AgentSpec::new("a"), failing("boom"))
        .await
        .unwrap();
    manager
        .create_task(TaskSpec::new("x", "").with_id("root").with_max_retries(0))
        .await
        .unwrap();
    manager
        .create_task(TaskSpec::new("x", "").with_id("mid").depends_on("root"))
        .await
        .unwrap();
    manager
        .create_task(TaskSpec::new("x", "").with_id("leaf").depends_on("mid"))
        .await
        .unwrap();

    let leaf = manager
        .wait_for_task(&TaskId::new("leaf"), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(leaf.status, TaskStatus::Cancelled);
    assert_eq!(
        manager.get_task_status(&TaskId::new("root")).await.unwrap(),
        TaskStatus::Failed
    );

    // Nothing new may depend on a task that will never complete
    let err = manager
        .create_task(TaskSpec::new("x", "").depends_on("root"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::DependencyFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn open_circuit_steers_work_to_healthy_agents() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.open_timeout_ms = 60_000;
    let manager = started_manager(config);

    manager
        .register_agent(AgentSpec::new("broken"), failing("crash"))
        .await
        .unwrap();
    let first = manager
        .create_task(TaskSpec::new("x", "").with_max_retries(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager
        .circuit_breakers()
        .is_open(&format!("agent:{}", AgentId::new("broken"))));

    manager
        .register_agent(AgentSpec::new("healthy"), succeeding())
        .await
        .unwrap();
    let task = manager.wait_for_task(&first, Duration::from_secs(10)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let second = manager.create_task(TaskSpec::new("x", "")).await.unwrap();
    let task = manager.wait_for_task(&second, Duration::from_secs(10)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let broken = manager.get_agent(&AgentId::new("broken")).await.unwrap();
    assert_eq!(broken.completed_tasks, 0);
    assert_eq!(broken.failed_tasks, 1);
}

#[tokio::test(start_paused = true)]
async fn rebalancing_moves_at_most_the_batch_size() {
    let mut config = test_config();
    config.work_stealing.max_steal_batch = 2;
    config.resources.acquire_timeout_ms = 600_000;
    let manager = started_manager(config);

    // Hold the gate outside the scheduler so every dispatch stays Assigned
    let _gate = manager
        .resources()
        .acquire(ResourceRequest::new(
            "gate",
            AgentId::new("gatekeeper"),
            Priority::NORMAL,
            Duration::from_secs(1),
        ))
        .await
        .unwrap();

    for donor in ["d1", "d2"] {
        manager
            .register_agent(
                AgentSpec::new(donor).with_max_concurrent_tasks(4),
                succeeding(),
            )
            .await
            .unwrap();
        for n in 0..4 {
            manager
                .create_task(
                    TaskSpec::new("x", "")
                        .with_id(format!("{donor}-{n}"))
                        .requires_resource("gate"),
                )
                .await
                .unwrap();
        }
    }
    for idle in ["r1", "r2"] {
        manager
            .register_agent(AgentSpec::new(idle).with_max_concurrent_tasks(4), succeeding())
            .await
            .unwrap();
    }
    assert_eq!(
        manager.get_agent(&AgentId::new("d1")).await.unwrap().current_tasks.len(),
        4
    );

    let moved = manager.scheduler().rebalance().await;
    assert_eq!(moved.len(), 2);
    assert_eq!(manager.metrics().tasks_stolen, 2);

    let mut received = 0;
    for idle in ["r1", "r2"] {
        received += manager.get_agent(&AgentId::new(idle)).await.unwrap().current_tasks.len();
    }
    assert_eq!(received, 2);
    for proposal in &moved {
        let task = manager.get_task(&proposal.task_id).await.unwrap();
        assert_eq!(task.assigned_agent.as_ref(), Some(&proposal.to));
        assert_eq!(task.status, TaskStatus::Assigned);
    }
}

#[tokio::test(start_paused = true)]
async fn deregistering_an_agent_releases_its_resources() {
    let manager = started_manager(test_config());
    manager
        .register_agent(AgentSpec::new("leaving"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let id = manager
        .create_task(TaskSpec::new("x", "").requires_resource("db").with_max_retries(0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.resources().holder_of(&"db".into()),
        Some(AgentId::new("leaving"))
    );

    manager.deregister_agent(&AgentId::new("leaving")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.resources().holder_of(&"db".into()), None);
    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.metadata_str("failure_reason").is_some());
    assert!(matches!(
        manager.get_agent_status(&AgentId::new("leaving")).await,
        Err(CoordinationError::AgentNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn waiting_without_a_deadline_returns_the_finished_task() {
    let manager = started_manager(test_config());
    manager
        .register_agent(AgentSpec::new("slow"), sleeping(Duration::from_secs(60)))
        .await
        .unwrap();
    let id = manager.create_task(TaskSpec::new("x", "")).await.unwrap();

    let task = manager.wait_for_task(&id, Duration::MAX).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn task_exceeding_its_own_timeout_fails_and_is_retried() {
    let manager = started_manager(test_config());
    let mut events = manager.subscribe();
    manager
        .register_agent(AgentSpec::new("stuck"), sleeping(Duration::from_secs(10)))
        .await
        .unwrap();
    let id = manager
        .create_task(
            TaskSpec::new("x", "")
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(1),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let task = manager.wait_for_task(&id, Duration::from_secs(60)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert!(task
        .metadata_str("failure_reason")
        .unwrap()
        .contains("timed out after 50ms"));

    let retries = events
        .drain()
        .into_iter()
        .filter(|event| matches!(event, CoordinationEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test(start_paused = true)]
async fn contended_resource_opens_its_circuit_and_holds_tasks_back() {
    let mut config = test_config();
    config.resources.acquire_timeout_ms = 100;
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.open_timeout_ms = 60_000;
    let manager = started_manager(config);
    let gate_key = format!("resource:{}", ResourceId::new("gate"));

    manager
        .resources()
        .acquire(ResourceRequest::new(
            "gate",
            AgentId::new("gatekeeper"),
            Priority::NORMAL,
            Duration::from_secs(1),
        ))
        .await
        .unwrap();
    manager
        .register_agent(AgentSpec::new("worker"), succeeding())
        .await
        .unwrap();
    let id = manager
        .create_task(TaskSpec::new("x", "").requires_resource("gate"))
        .await
        .unwrap();

    // One acquire timeout trips the breaker; the task waits in the queue
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.circuit_breakers().state(&gate_key), CircuitState::Open);
    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.metadata_str("requeue_reason"), Some("resource_timeout"));

    // Further scheduling passes leave it alone while the circuit is open
    tokio::time::sleep(Duration::from_secs(10)).await;
    manager.scheduler().schedule_once().await;
    assert_eq!(manager.get_task(&id).await.unwrap().status, TaskStatus::Queued);

    manager
        .release_resource(&ResourceId::new("gate"), &AgentId::new("gatekeeper"))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    manager.scheduler().schedule_once().await;

    let task = manager.wait_for_task(&id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(manager.circuit_breakers().state(&gate_key), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn duplicate_registration_keeps_the_original_mailbox() {
    let manager = started_manager(test_config());
    let mut mailbox = manager
        .register_agent(AgentSpec::new("solo"), succeeding())
        .await
        .unwrap();

    let err = manager
        .register_agent(AgentSpec::new("solo"), succeeding())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::DuplicateAgent(_)));

    manager
        .messaging()
        .notify(
            swarm_coordinator::Address::Coordinator,
            swarm_coordinator::Recipient::Agent(AgentId::new("solo")),
            "ping",
            serde_json::json!({}),
        )
        .unwrap();
    let message = mailbox.recv().await.unwrap();
    assert_eq!(message.topic, "ping");
}
