//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarm_coordinator::{
    CoordinationConfig, CoordinationManager, FnExecutor, Task, TaskExecutor, TaskOutput,
};

/// Defaults with maintenance jobs spaced far enough apart not to interfere
pub fn test_config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.scheduler.retry_base_delay_ms = 100;
    config.scheduler.retry_max_delay_ms = 10_000;
    config.maintenance.heartbeat_timeout_ms = 0;
    config.work_stealing.enabled = false;
    config
}

pub fn started_manager(config: CoordinationConfig) -> CoordinationManager {
    let manager = CoordinationManager::new(config).expect("valid test configuration");
    manager.start();
    manager
}

pub fn succeeding() -> Arc<dyn TaskExecutor> {
    FnExecutor::shared(|task: Task| async move { Ok(TaskOutput::new(format!("ran {}", task.id))) })
}

pub fn failing(message: &'static str) -> Arc<dyn TaskExecutor> {
    FnExecutor::shared(move |_task: Task| async move { Err(anyhow::anyhow!(message)) })
}

pub fn sleeping(duration: Duration) -> Arc<dyn TaskExecutor> {
    FnExecutor::shared(move |_task: Task| async move {
        tokio::time::sleep(duration).await;
        Ok(TaskOutput::default())
    })
}

/// Executor that counts its invocations
pub fn counting(counter: Arc<AtomicU32>, succeed: bool) -> Arc<dyn TaskExecutor> {
    FnExecutor::shared(move |_task: Task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok(TaskOutput::default())
            } else {
                Err(anyhow::anyhow!("executor failure"))
            }
        }
    })
}

