//! Executor capability invoked once a task is assigned and holds its
//! resources.
//!
//! The engine treats execution as an opaque async call: whatever the
//! executor does, its `Ok`/`Err` feeds the task state machine and the
//! agent's circuit breaker.

use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::types::{Task, TaskOutput};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` to completion
    async fn execute(&self, task: &Task) -> Result<TaskOutput>;
}

type BoxedRun = Box<dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<TaskOutput>> + Send>> + Send + Sync>;

/// Adapts an async closure. The closure receives an owned copy of the task.
pub struct FnExecutor {
    run: BoxedRun,
}

impl FnExecutor {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        Self {
            run: Box::new(move |task| Box::pin(run(task))),
        }
    }

    pub fn shared<F, Fut>(run: F) -> Arc<dyn TaskExecutor>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        Arc::new(Self::new(run))
    }
}

#[async_trait::async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(&self, task: &Task) -> Result<TaskOutput> {
        (self.run)(task.clone()).await
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

/// Runs `metadata["command"]` through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    working_dir: Option<std::path::PathBuf>,
}

impl ShellExecutor {
    pub const COMMAND_KEY: &'static str = "command";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait::async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task) -> Result<TaskOutput> {
        let command = task
            .metadata_str(Self::COMMAND_KEY)
            .ok_or_else(|| anyhow!("task {} has no '{}' metadata", task.id, Self::COMMAND_KEY))?;

        debug!(task_id = %task.id, command = %command, "Running shell task");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("SWARM_TASK_ID", task.id.as_str())
            .env("SWARM_TASK_TYPE", &task.task_type)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Task timeouts drop this future; the child must not outlive it
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn command for task {}", task.id))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(TaskOutput::new(format!("exit {}", output.status))
            .with_data(serde_json::json!({ "stdout": stdout })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;
    use serde_json::json;

    fn shell_task(command: &str) -> Task {
        Task::from_spec(
            TaskSpec::new("shell", "").with_metadata("command", json!(command)),
            0,
        )
    }

    #[tokio::test]
    async fn test_fn_executor_passes_task() {
        let executor = FnExecutor::new(|task: Task| async move {
            Ok(TaskOutput::new(format!("ran {}", task.task_type)))
        });
        let output = executor
            .execute(&Task::from_spec(TaskSpec::new("lint", ""), 0))
            .await
            .unwrap();
        assert_eq!(output.summary.as_deref(), Some("ran lint"));
    }

    #[tokio::test]
    async fn test_shell_executor_captures_stdout() {
        let output = ShellExecutor::new()
            .execute(&shell_task("echo hello"))
            .await
            .unwrap();
        assert_eq!(output.data["stdout"], json!("hello"));
    }

    #[tokio::test]
    async fn test_shell_executor_reports_failure() {
        let err = ShellExecutor::new()
            .execute(&shell_task("echo broken >&2; exit 3"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_shell_executor_requires_command() {
        let task = Task::from_spec(TaskSpec::new("shell", ""), 0);
        assert!(ShellExecutor::new().execute(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_executor() {
        let mut mock = MockTaskExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Err(anyhow!("agent crashed")));
        let task = Task::from_spec(TaskSpec::new("x", ""), 0);
        assert!(mock.execute(&task).await.is_err());
    }
}
