//! Layered configuration: defaults, then a TOML file, then
//! SWARM_COORD__ environment variables

use std::io::Write;

use swarm_coordinator::{AssignmentStrategyKind, CoordinationConfig, ResolutionStrategy};

// Environment variables are process-wide, so every case runs in one test
#[test]
fn file_and_environment_layer_over_defaults() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
[scheduler]
assignment_strategy = "round_robin"
default_max_retries = 7

[conflicts]
strategy = "timestamp"
"#
    )
    .unwrap();

    let loaded = CoordinationConfig::load(Some(file.path())).unwrap();
    assert_eq!(loaded.scheduler.assignment_strategy, AssignmentStrategyKind::RoundRobin);
    assert_eq!(loaded.scheduler.default_max_retries, 7);
    assert_eq!(loaded.conflicts.strategy, ResolutionStrategy::Timestamp);
    assert_eq!(
        loaded.circuit_breaker.failure_threshold,
        CoordinationConfig::default().circuit_breaker.failure_threshold
    );

    std::env::set_var("SWARM_COORD__SCHEDULER__DEFAULT_MAX_RETRIES", "9");
    std::env::set_var("SWARM_COORD__WORK_STEALING__ENABLED", "false");
    let overridden = CoordinationConfig::load(Some(file.path()));
    std::env::remove_var("SWARM_COORD__SCHEDULER__DEFAULT_MAX_RETRIES");
    std::env::remove_var("SWARM_COORD__WORK_STEALING__ENABLED");

    let overridden = overridden.unwrap();
    assert_eq!(overridden.scheduler.default_max_retries, 9);
    assert!(!overridden.work_stealing.enabled);
    assert_eq!(overridden.scheduler.assignment_strategy, AssignmentStrategyKind::RoundRobin);

    // Values that pass parsing but not validation are rejected at load
    std::env::set_var("SWARM_COORD__CONFLICTS__QUORUM", "0");
    let invalid = CoordinationConfig::load(Some(file.path()));
    std::env::remove_var("SWARM_COORD__CONFLICTS__QUORUM");
    assert!(invalid.is_err());
}
