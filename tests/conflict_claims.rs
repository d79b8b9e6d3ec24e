//! Ownership claims on assigned tasks, settled by priority and by agent
//! votes collected over the messaging system

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use swarm_coordinator::conflict::ConflictOutcome;
use swarm_coordinator::{
    Address, AgentId, AgentSpec, ClaimOutcome, CoordinationConfig, CoordinationManager, Mailbox,
    Message, Priority, ResolutionStrategy, ResourceRequest, TaskId, TaskSpec, TaskStatus,
};

mod fixtures;
use fixtures::*;

/// Answer every ballot with `candidate` (or stay silent when `None`) and
/// forward every other message to the returned channel
fn spawn_voter(
    manager: &CoordinationManager,
    mut mailbox: Mailbox,
    candidate: Option<&'static str>,
) -> mpsc::UnboundedReceiver<Message> {
    let messaging = manager.messaging().clone();
    let (forward, received) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let me = mailbox.agent_id().clone();
        while let Some(message) = mailbox.recv().await {
            if message.topic == "conflict.vote" {
                if let Some(candidate) = candidate {
                    let _ = messaging.respond(
                        &message,
                        Address::Agent(me.clone()),
                        json!({ "candidate": candidate }),
                    );
                }
            } else {
                let _ = forward.send(message);
            }
        }
    });
    received
}

/// Config whose dispatches wait long enough on the gate resource
fn claim_config() -> CoordinationConfig {
    let mut config = test_config();
    config.resources.acquire_timeout_ms = 600_000;
    config
}

/// Create a task that `owner` gets assigned but cannot start, because the
/// gate it requires is held outside the scheduler
async fn owned_task(manager: &CoordinationManager, owner: Mailbox) -> (TaskId, Mailbox) {
    manager
        .resources()
        .acquire(ResourceRequest::new(
            "gate",
            "gatekeeper",
            Priority::NORMAL,
            Duration::from_secs(1),
        ))
        .await
        .unwrap();
    let task = manager
        .create_task(
            TaskSpec::new("x", "")
                .with_id("contested")
                .requires_resource("gate"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let status = manager.get_task(&task).await.unwrap();
    assert_eq!(status.status, TaskStatus::Assigned);
    assert_eq!(status.assigned_agent, Some(AgentId::new("owner")));
    (task, owner)
}

fn lost_notice(received: &mut mpsc::UnboundedReceiver<Message>) -> Option<Value> {
    std::iter::from_fn(|| received.try_recv().ok())
        .find(|message| message.topic == "conflict.lost")
        .map(|message| message.payload)
}

#[tokio::test(start_paused = true)]
async fn higher_priority_claimant_takes_over_an_assigned_task() {
    let manager = started_manager(claim_config());
    let owner = manager
        .register_agent(
            AgentSpec::new("owner").with_priority(Priority(1)),
            sleeping(Duration::from_secs(600)),
        )
        .await
        .unwrap();
    let (task, owner) = owned_task(&manager, owner).await;
    let mut owner_inbox = spawn_voter(&manager, owner, None);

    manager
        .register_agent(
            AgentSpec::new("urgent").with_priority(Priority(9)),
            sleeping(Duration::from_secs(600)),
        )
        .await
        .unwrap();

    let outcome = manager.claim_task(&task, &AgentId::new("urgent")).await.unwrap();
    let ClaimOutcome::Contested(record) = outcome else {
        panic!("expected a contested claim, got {outcome:?}");
    };
    assert_eq!(record.strategy, ResolutionStrategy::Priority);
    assert_eq!(record.resolved_winner, Some(AgentId::new("urgent")));

    let task = manager.get_task(&task).await.unwrap();
    assert_eq!(task.assigned_agent, Some(AgentId::new("urgent")));
    assert_eq!(task.status, TaskStatus::Assigned);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let notice = lost_notice(&mut owner_inbox).expect("owner is told it lost");
    assert_eq!(notice["winner"], json!("urgent"));
}

#[tokio::test(start_paused = true)]
async fn owner_claiming_again_is_a_no_op() {
    let manager = started_manager(claim_config());
    let owner = manager
        .register_agent(AgentSpec::new("owner"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let (task, _owner) = owned_task(&manager, owner).await;

    let outcome = manager.claim_task(&task, &AgentId::new("owner")).await.unwrap();
    assert!(matches!(outcome, ClaimOutcome::AlreadyOwned));
}

#[tokio::test(start_paused = true)]
async fn voting_moves_the_task_to_the_elected_agent() {
    let mut config = claim_config();
    config.conflicts.strategy = ResolutionStrategy::Voting;
    let manager = started_manager(config);

    let owner = manager
        .register_agent(AgentSpec::new("owner"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let (task, owner) = owned_task(&manager, owner).await;
    let mut owner_inbox = spawn_voter(&manager, owner, Some("challenger"));

    for (name, ballot) in [("challenger", "challenger"), ("bystander", "challenger")] {
        let mailbox = manager
            .register_agent(AgentSpec::new(name), sleeping(Duration::from_secs(600)))
            .await
            .unwrap();
        spawn_voter(&manager, mailbox, Some(ballot));
    }

    let outcome = manager
        .claim_task(&task, &AgentId::new("challenger"))
        .await
        .unwrap();
    let ClaimOutcome::Contested(record) = outcome else {
        panic!("expected a contested claim, got {outcome:?}");
    };
    assert_eq!(record.outcome, ConflictOutcome::Resolved);
    assert_eq!(record.resolved_winner, Some(AgentId::new("challenger")));
    assert_eq!(
        manager.get_task(&task).await.unwrap().assigned_agent,
        Some(AgentId::new("challenger"))
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(lost_notice(&mut owner_inbox).is_some());
}

#[tokio::test(start_paused = true)]
async fn silent_electorate_leaves_the_task_with_its_owner() {
    let mut config = claim_config();
    config.conflicts.strategy = ResolutionStrategy::Voting;
    config.conflicts.vote_timeout_ms = 500;
    let manager = started_manager(config);

    let owner = manager
        .register_agent(AgentSpec::new("owner"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let (task, owner) = owned_task(&manager, owner).await;
    spawn_voter(&manager, owner, None);

    let challenger = manager
        .register_agent(AgentSpec::new("challenger"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let mut challenger_inbox = spawn_voter(&manager, challenger, Some("challenger"));
    for name in ["quiet-1", "quiet-2"] {
        let mailbox = manager
            .register_agent(AgentSpec::new(name), sleeping(Duration::from_secs(600)))
            .await
            .unwrap();
        spawn_voter(&manager, mailbox, None);
    }

    let started = tokio::time::Instant::now();
    let outcome = manager
        .claim_task(&task, &AgentId::new("challenger"))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));

    let ClaimOutcome::Contested(record) = outcome else {
        panic!("expected a contested claim, got {outcome:?}");
    };
    // One ballot out of four voters misses the quorum
    assert_eq!(record.outcome, ConflictOutcome::DefaultedToHolder);
    assert_eq!(record.resolved_winner, Some(AgentId::new("owner")));
    assert_eq!(
        manager.get_task(&task).await.unwrap().assigned_agent,
        Some(AgentId::new("owner"))
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(lost_notice(&mut challenger_inbox).is_some());
    assert_eq!(manager.conflicts().records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn claim_on_a_task_cancelled_during_the_vote_is_refused() {
    let mut config = claim_config();
    config.conflicts.strategy = ResolutionStrategy::Voting;
    config.conflicts.vote_timeout_ms = 500;
    let manager = started_manager(config);

    let owner = manager
        .register_agent(AgentSpec::new("owner"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    let (task, owner) = owned_task(&manager, owner).await;
    spawn_voter(&manager, owner, None);
    let challenger = manager
        .register_agent(AgentSpec::new("challenger"), sleeping(Duration::from_secs(600)))
        .await
        .unwrap();
    spawn_voter(&manager, challenger, None);

    let challenger_id = AgentId::new("challenger");
    let (outcome, cancelled) = tokio::join!(
        manager.claim_task(&task, &challenger_id),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.cancel_task(&task, "withdrawn").await
        }
    );
    cancelled.unwrap();
    assert!(matches!(
        outcome,
        Err(swarm_coordinator::CoordinationError::ConflictUnresolved { .. })
    ));
    let task = manager.get_task(&task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.assigned_agent, None);
}
