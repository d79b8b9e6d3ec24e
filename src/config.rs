use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::conflict::ResolutionStrategy;
use crate::scheduler::assignment::AssignmentStrategyKind;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "swarm-coordinator.toml";
/// Environment variable prefix, e.g. `SWARM_COORD__SCHEDULER__DEFAULT_MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "SWARM_COORD";

/// Main configuration structure for the coordination engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Task queue, assignment and retry settings
    pub scheduler: SchedulerConfig,
    /// Resource locking and deadlock detection
    pub resources: ResourcesConfig,
    /// Mailboxes and request/response timeouts
    pub messaging: MessagingConfig,
    /// Work-stealing load balancer
    pub work_stealing: WorkStealingConfig,
    /// Per-agent and per-resource circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,
    /// Conflict resolution and audit retention
    pub conflicts: ConflictsConfig,
    /// Background maintenance loop
    pub maintenance: MaintenanceConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How queued tasks are matched to agents
    pub assignment_strategy: AssignmentStrategyKind,
    /// Retries granted to tasks that do not set their own limit
    pub default_max_retries: u32,
    /// First retry delay; doubles with every retry
    pub retry_base_delay_ms: u64,
    /// Upper bound for the retry delay
    pub retry_max_delay_ms: u64,
    /// Add up to 10% random jitter to retry delays
    pub retry_jitter: bool,
    /// Executor timeout for tasks that do not set their own
    pub task_timeout_ms: u64,
    /// Consecutive failed resource acquisitions before an attempt counts as failed
    pub max_acquire_attempts: u32,
    /// Capacity of the scheduler's internal command channel
    pub command_buffer: usize,
    /// Finished tasks kept for status queries after pruning
    pub archive_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assignment_strategy: AssignmentStrategyKind::CapabilityBased,
            default_max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter: false,
            task_timeout_ms: 300_000, // 5 minutes
            max_acquire_attempts: 3,
            command_buffer: 1_024,
            archive_limit: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// How long a dispatch waits for each required resource
    pub acquire_timeout_ms: u64,
    /// Period of the background deadlock scan
    pub deadlock_scan_interval_ms: u64,
    /// Capacity of the contention report channel
    pub contention_buffer: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            deadlock_scan_interval_ms: 1_000,
            contention_buffer: 256,
        }
    }
}

impl ResourcesConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn deadlock_scan_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_scan_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messages buffered per agent mailbox
    pub mailbox_capacity: usize,
    /// Request timeout used when callers do not pass one
    pub default_timeout_ms: u64,
    /// Period of the expired-request sweep
    pub sweep_interval_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            default_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl MessagingConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkStealingConfig {
    pub enabled: bool,
    /// Period of the rebalance cycle
    pub interval_ms: u64,
    /// Load ratio above which an agent donates work
    pub high_water: f64,
    /// Load ratio below which an agent receives work
    pub low_water: f64,
    /// Tasks moved per cycle at most
    pub max_steal_batch: usize,
}

impl Default for WorkStealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            high_water: 0.75,
            low_water: 0.25,
            max_steal_batch: 2,
        }
    }
}

impl WorkStealingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window_ms` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before probes are allowed
    pub open_timeout_ms: u64,
    /// Failures older than this no longer count
    pub failure_window_ms: u64,
    /// Concurrent probe calls allowed while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            failure_window_ms: 60_000,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Strategy for task ownership conflicts
    pub strategy: ResolutionStrategy,
    /// Conflict records kept for diagnostics
    pub retention: usize,
    /// Fraction of expected voting weight needed for a voting result
    pub quorum: f64,
    /// How long votes are collected
    pub vote_timeout_ms: u64,
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::Priority,
            retention: 1_000,
            quorum: 0.5,
            vote_timeout_ms: 2_000,
        }
    }
}

impl ConflictsConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Period of health checks, heartbeat expiry, metrics snapshots and checkpoints
    pub health_interval_ms: u64,
    /// Agents silent for longer are marked offline; 0 disables expiry
    pub heartbeat_timeout_ms: u64,
    /// Period of finished-task pruning
    pub prune_interval_ms: u64,
    /// Finished tasks older than this are pruned
    pub finished_task_ttl_ms: u64,
    /// Time slice any single maintenance job may take
    pub max_job_duration_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            heartbeat_timeout_ms: 60_000,
            prune_interval_ms: 30_000,
            finished_task_ttl_ms: 300_000,
            max_job_duration_ms: 500,
        }
    }
}

impl MaintenanceConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// `None` when heartbeat expiry is disabled
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn finished_task_ttl(&self) -> Duration {
        Duration::from_millis(self.finished_task_ttl_ms)
    }

    pub fn max_job_duration(&self) -> Duration {
        Duration::from_millis(self.max_job_duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of human readable ones
    pub json_logs: bool,
    /// Events a slow subscriber may fall behind before losing the oldest
    pub event_buffer: usize,
    /// Log a metrics snapshot on every health check
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            event_buffer: 1_024,
            metrics_enabled: true,
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`path`, or swarm-coordinator.toml if present)
    /// 3. Environment variables (prefixed with SWARM_COORD__)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&CoordinationConfig::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Configuration file not found: {}", path.display());
                }
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: CoordinationConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoordinationConfig =
            toml::from_str(content).context("Failed to parse configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.retry_base_delay_ms > self.scheduler.retry_max_delay_ms {
            bail!("scheduler.retry_base_delay_ms must not exceed scheduler.retry_max_delay_ms");
        }
        if self.scheduler.task_timeout_ms == 0 {
            bail!("scheduler.task_timeout_ms must be greater than zero");
        }
        if self.scheduler.max_acquire_attempts == 0 {
            bail!("scheduler.max_acquire_attempts must be at least 1");
        }
        if self.scheduler.command_buffer == 0 {
            bail!("scheduler.command_buffer must be at least 1");
        }
        if self.resources.acquire_timeout_ms == 0 {
            bail!("resources.acquire_timeout_ms must be greater than zero");
        }
        if self.resources.contention_buffer == 0 {
            bail!("resources.contention_buffer must be at least 1");
        }
        if self.messaging.mailbox_capacity == 0 {
            bail!("messaging.mailbox_capacity must be at least 1");
        }
        if self.messaging.default_timeout_ms == 0 {
            bail!("messaging.default_timeout_ms must be greater than zero");
        }

        let ws = &self.work_stealing;
        if !(0.0..=1.0).contains(&ws.low_water) || !(0.0..=1.0).contains(&ws.high_water) {
            bail!("work_stealing water marks must lie within [0, 1]");
        }
        if ws.low_water >= ws.high_water {
            bail!(
                "work_stealing.low_water ({}) must be below work_stealing.high_water ({})",
                ws.low_water,
                ws.high_water
            );
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            bail!("circuit_breaker thresholds must be at least 1");
        }
        if cb.half_open_max_probes == 0 {
            bail!("circuit_breaker.half_open_max_probes must be at least 1");
        }

        if !(self.conflicts.quorum > 0.0 && self.conflicts.quorum <= 1.0) {
            bail!("conflicts.quorum must lie within (0, 1]");
        }
        if self.observability.event_buffer == 0 {
            bail!("observability.event_buffer must be at least 1");
        }

        // Intervals drive tokio::time::interval, which panics on zero
        let intervals = [
            ("resources.deadlock_scan_interval_ms", self.resources.deadlock_scan_interval_ms),
            ("messaging.sweep_interval_ms", self.messaging.sweep_interval_ms),
            ("work_stealing.interval_ms", self.work_stealing.interval_ms),
            ("maintenance.health_interval_ms", self.maintenance.health_interval_ms),
            ("maintenance.prune_interval_ms", self.maintenance.prune_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.work_stealing.max_steal_batch, 2);
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert_eq!(
            config.scheduler.assignment_strategy,
            AssignmentStrategyKind::CapabilityBased
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            [scheduler]
            assignment_strategy = "least_loaded"
            default_max_retries = 5

            [conflicts]
            strategy = "voting"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.default_max_retries, 5);
        assert_eq!(config.scheduler.assignment_strategy, AssignmentStrategyKind::LeastLoaded);
        assert_eq!(config.conflicts.strategy, ResolutionStrategy::Voting);
        assert_eq!(config.scheduler.retry_base_delay_ms, 1_000);
        assert_eq!(config.messaging.mailbox_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_inverted_water_marks() {
        let mut config = CoordinationConfig::default();
        config.work_stealing.low_water = 0.8;
        config.work_stealing.high_water = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quorum_and_thresholds() {
        let mut config = CoordinationConfig::default();
        config.conflicts.quorum = 0.0;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.maintenance.health_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_zero_disables_expiry() {
        let mut config = MaintenanceConfig::default();
        assert!(config.heartbeat_timeout().is_some());
        config.heartbeat_timeout_ms = 0;
        assert!(config.heartbeat_timeout().is_none());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");

        let mut config = CoordinationConfig::default();
        config.resources.acquire_timeout_ms = 1_234;
        config.save_to_file(&path).unwrap();

        let loaded = CoordinationConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.resources.acquire_timeout_ms, 1_234);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = CoordinationConfig::load(Some(Path::new("/nonexistent/coordinator.toml")));
        assert!(result.is_err());
    }
}
