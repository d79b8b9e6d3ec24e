use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use swarm_coordinator::{
    init_telemetry, shutdown_telemetry, AgentSpec, CoordinationConfig, CoordinationError,
    CoordinationManager, DependencyGraph, ShellExecutor, Task, TaskExecutor, TaskId, TaskSpec,
    TaskStatus,
};

#[derive(Parser)]
#[command(name = "swarm-coordinator")]
#[command(about = "Multi-agent task coordination engine")]
#[command(long_about = "Runs a plan of dependent tasks across a pool of agents with priority \
                       scheduling, resource locking, retries and work stealing. Start with \
                       'swarm-coordinator validate --plan plan.toml'.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan: register its agents, create its tasks and wait for them
    Run {
        /// Plan file with [[agents]] and [[tasks]] tables
        #[arg(long)]
        plan: PathBuf,
        /// Configuration file (defaults to swarm-coordinator.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit JSON log lines
        #[arg(long)]
        json_logs: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,
    },
    /// Check a plan's dependency graph without running anything
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// A plan file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Plan {
    agents: Vec<AgentSpec>,
    tasks: Vec<TaskSpec>,
}

impl Plan {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        let mut plan: Plan = toml::from_str(content)?;
        for (index, task) in plan.tasks.iter_mut().enumerate() {
            if task.id.is_none() {
                task.id = Some(TaskId::new(format!("task-{}", index + 1)));
            }
        }
        let mut seen = HashSet::new();
        for task in &plan.tasks {
            if let Some(id) = &task.id {
                if !seen.insert(id.clone()) {
                    bail!("duplicate task id {id}");
                }
            }
        }
        Ok(plan)
    }

    /// Tasks reordered so every task follows its dependencies
    fn creation_order(&self) -> Result<Vec<TaskSpec>> {
        let mut created: BTreeSet<TaskId> = BTreeSet::new();
        let mut remaining: Vec<&TaskSpec> = self.tasks.iter().collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&TaskSpec>, Vec<&TaskSpec>) = remaining
                .into_iter()
                .partition(|task| task.dependencies.is_subset(&created));
            if ready.is_empty() {
                bail!("plan has unknown or cyclic dependencies; run 'swarm-coordinator validate' for details");
            }
            for task in ready {
                if let Some(id) = &task.id {
                    created.insert(id.clone());
                }
                ordered.push(task.clone());
            }
            remaining = blocked;
        }
        Ok(ordered)
    }

    /// Build the dependency graph: nodes first, then one edge at a time so
    /// cycles are reported with their path
    fn graph(&self) -> Result<DependencyGraph, CoordinationError> {
        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            if let Some(id) = &task.id {
                let duration = Duration::from_millis(task.estimated_duration_ms.unwrap_or(0));
                graph.add_task(id, &BTreeSet::new(), duration)?;
            }
        }
        for task in &self.tasks {
            if let Some(id) = &task.id {
                for dependency in &task.dependencies {
                    graph.add_dependency(id, dependency)?;
                }
            }
        }
        Ok(graph)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            plan,
            config,
            json_logs,
            timeout_secs,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            run_command(&plan, config.as_deref(), json_logs, Duration::from_secs(timeout_secs)).await
        }),
        Commands::Validate { plan } => validate_command(&plan),
        Commands::Config {
            command: ConfigCommands::Show { config },
        } => {
            let config = CoordinationConfig::load(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn validate_command(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    println!("📋 Plan: {} agents, {} tasks", plan.agents.len(), plan.tasks.len());

    let graph = match plan.graph() {
        Ok(graph) => graph,
        Err(err @ CoordinationError::CycleDetected { .. }) => {
            println!("❌ {err}");
            bail!("plan is not a valid dependency graph");
        }
        Err(err) => return Err(err.into()),
    };

    println!();
    println!("🔀 Execution order:");
    for (index, id) in graph.topological_order().iter().enumerate() {
        println!("  {:>3}. {id}", index + 1);
    }

    let critical = graph.critical_path();
    println!();
    println!(
        "⏱️  Critical path ({} ms): {}",
        critical.total_duration.as_millis(),
        critical
            .tasks
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let unroutable: Vec<&TaskSpec> = plan
        .tasks
        .iter()
        .filter(|task| {
            !plan
                .agents
                .iter()
                .any(|agent| task.required_capabilities.is_subset(&agent.capabilities))
        })
        .collect();
    for task in &unroutable {
        println!(
            "⚠️  No agent can run {} (needs {:?})",
            task.id.as_ref().map(|id| id.as_str()).unwrap_or("?"),
            task.required_capabilities
        );
    }

    println!();
    println!("✅ Plan is valid");
    Ok(())
}

async fn run_command(
    plan_path: &Path,
    config_path: Option<&Path>,
    json_logs: bool,
    timeout: Duration,
) -> Result<()> {
    CoordinationConfig::load_env_file()?;
    let mut config = CoordinationConfig::load(config_path)?;
    config.observability.json_logs |= json_logs;
    init_telemetry(&config.observability)?;

    let plan = Plan::load(plan_path)?;
    let ordered = plan.creation_order()?;
    let workdir = plan_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let heartbeat_every = config
        .maintenance
        .heartbeat_timeout()
        .map(|ttl| ttl / 3)
        .unwrap_or(Duration::from_secs(30))
        .max(Duration::from_millis(100));

    let manager = CoordinationManager::new(config)?;
    manager.start();

    let executor: Arc<dyn TaskExecutor> = Arc::new(ShellExecutor::in_dir(workdir));
    let mut agent_ids = Vec::new();
    for spec in plan.agents {
        // Local shell agents never read their mailbox
        let mailbox = manager.register_agent(spec, executor.clone()).await?;
        agent_ids.push(mailbox.agent_id().clone());
    }

    let heartbeats = {
        let manager = manager.clone();
        let agent_ids = agent_ids.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_every);
            loop {
                ticker.tick().await;
                for agent_id in &agent_ids {
                    if let Err(err) = manager.heartbeat(agent_id).await {
                        warn!(agent_id = %agent_id, error = %err, "Heartbeat failed");
                    }
                }
            }
        })
    };

    let mut task_ids = Vec::new();
    for spec in ordered {
        task_ids.push(manager.create_task(spec).await?);
    }
    info!(tasks = task_ids.len(), agents = agent_ids.len(), "Plan submitted");

    let waiting = async {
        let mut finished = Vec::new();
        for id in &task_ids {
            finished.push(manager.wait_for_task(id, timeout).await?);
        }
        Ok::<Vec<Task>, CoordinationError>(finished)
    };

    let tasks = tokio::select! {
        finished = waiting => finished?,
        signal = manager.wait_for_signal() => {
            signal?;
            warn!("Interrupted, cancelling outstanding tasks");
            for id in &task_ids {
                let _ = manager.cancel_task(id, "interrupted").await;
            }
            manager.list_tasks().await
        }
    };

    heartbeats.abort();
    print_report(&tasks);
    let health = manager.get_health().await;
    println!();
    println!(
        "🩺 Health: {} | agents {}/{} | completed {} | failed {} | deadlocks resolved {} | conflicts {}",
        health.status,
        health.healthy_agents,
        health.total_agents,
        health.tasks_completed,
        health.tasks_failed,
        health.deadlocks_resolved,
        health.conflicts_recorded
    );

    manager.shutdown().await;
    shutdown_telemetry();

    let unfinished = tasks
        .iter()
        .filter(|task| task.status != TaskStatus::Completed)
        .count();
    if unfinished > 0 {
        bail!("{unfinished} task(s) did not complete");
    }
    Ok(())
}

fn print_report(tasks: &[Task]) {
    println!();
    println!("{:<24} {:<10} {:<16} {:>8}  {}", "TASK", "STATUS", "AGENT", "ATTEMPTS", "DETAIL");
    for task in tasks {
        let icon = match task.status {
            TaskStatus::Completed => "✅",
            TaskStatus::Failed => "❌",
            TaskStatus::Cancelled => "🚫",
            _ => "⏳",
        };
        let detail = task
            .metadata_str("failure_reason")
            .or_else(|| task.metadata_str("cancel_reason"))
            .or(task.last_error.as_deref())
            .unwrap_or("");
        let agent = task
            .assigned_agent
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<10} {:<16} {:>8}  {icon} {detail}",
            task.id.as_str(),
            task.status.to_string(),
            agent,
            task.attempts,
        );
    }
}
