use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Engine-wide counters, shared by the scheduler and the maintenance loop
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    pub tasks_created: AtomicU64,
    pub tasks_assigned: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_stolen: AtomicU64,
    pub acquire_failures: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub stale_results: AtomicU64,
    pub maintenance_overruns: AtomicU64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_assigned(&self) {
        self.tasks_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stolen(&self) {
        self.tasks_stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_failure(&self) {
        self.acquire_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_result(&self) {
        self.stale_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_maintenance_overrun(&self) {
        self.maintenance_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_created: self.tasks_created.load(Ordering::Relaxed),
            tasks_assigned: self.tasks_assigned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_stolen: self.tasks_stolen.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
            maintenance_overruns: self.maintenance_overruns.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self) {
        let stats = self.snapshot();
        info!(
            tasks_created = stats.tasks_created,
            tasks_assigned = stats.tasks_assigned,
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            tasks_cancelled = stats.tasks_cancelled,
            tasks_retried = stats.tasks_retried,
            tasks_stolen = stats.tasks_stolen,
            acquire_failures = stats.acquire_failures,
            "Coordination metrics"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    pub tasks_stolen: u64,
    pub acquire_failures: u64,
    pub circuit_rejections: u64,
    pub stale_results: u64,
    pub maintenance_overruns: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> u128 {
        let duration_ms = self.start.elapsed().as_millis();
        tracing::debug!(
            operation = %self.operation,
            duration_ms,
            "Operation completed"
        );
        duration_ms
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr, $body:expr) => {{
        let timer = $crate::observability::OperationTimer::new($operation);
        let value = $body;
        timer.finish();
        value
    }};
}
