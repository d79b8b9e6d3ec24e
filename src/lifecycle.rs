use statig::prelude::*;
use std::fmt;

use crate::error::{CoordinationError, Result};
use crate::types::{TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Dependencies satisfied or retry delay elapsed
    Enqueue,
    /// A new unmet dependency was added to a queued task
    Block,
    Assign,
    Start,
    Complete,
    Fail,
    Retry,
    /// Return unstarted (or interrupted) work to the queue
    Requeue,
    Cancel,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleEvent::Enqueue => "enqueue",
            LifecycleEvent::Block => "block",
            LifecycleEvent::Assign => "assign",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::Fail => "fail",
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::Requeue => "requeue",
            LifecycleEvent::Cancel => "cancel",
        };
        f.write_str(label)
    }
}

pub struct TaskLifecycle {
    pub task_id: TaskId,
}

#[state_machine(initial = "State::pending()")]
impl TaskLifecycle {
    #[state]
    fn pending(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Enqueue => Transition(State::queued()),
            LifecycleEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn queued(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Assign => Transition(State::assigned()),
            LifecycleEvent::Block => Transition(State::pending()),
            LifecycleEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn assigned(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => Transition(State::running()),
            LifecycleEvent::Requeue => Transition(State::queued()),
            // Resource acquisition gave up for good
            LifecycleEvent::Fail => Transition(State::failed()),
            LifecycleEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Complete => Transition(State::completed()),
            LifecycleEvent::Fail => Transition(State::failed()),
            LifecycleEvent::Requeue => Transition(State::queued()),
            LifecycleEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn failed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Retry => Transition(State::retrying()),
            _ => Handled,
        }
    }

    #[state]
    fn retrying(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Enqueue => Transition(State::queued()),
            LifecycleEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn completed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn cancelled(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

/// Owns the state machine for one task and turns ignored events into
/// `InvalidTransition` errors.
pub struct Lifecycle {
    machine: StateMachine<TaskLifecycle>,
    task_id: TaskId,
}

impl Lifecycle {
    pub fn new(task_id: TaskId) -> Self {
        let machine = TaskLifecycle {
            task_id: task_id.clone(),
        }
        .state_machine();
        Self { machine, task_id }
    }

    pub fn status(&self) -> TaskStatus {
        match self.machine.state() {
            State::Pending { .. } => TaskStatus::Pending,
            State::Queued { .. } => TaskStatus::Queued,
            State::Assigned { .. } => TaskStatus::Assigned,
            State::Running { .. } => TaskStatus::Running,
            State::Completed { .. } => TaskStatus::Completed,
            State::Failed { .. } => TaskStatus::Failed,
            State::Retrying { .. } => TaskStatus::Retrying,
            State::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }

    /// Apply `event`, returning `(from, to)`. Every accepted event moves
    /// the task to a different status.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<(TaskStatus, TaskStatus)> {
        let from = self.status();
        self.machine.handle(&event);
        let to = self.status();

        if from == to {
            return Err(CoordinationError::InvalidTransition {
                task_id: self.task_id.clone(),
                status: from.to_string(),
                event: event.to_string(),
            });
        }

        tracing::debug!(task_id = %self.task_id, %from, %to, %event, "Task transition");
        Ok((from, to))
    }

    /// True if `event` would be accepted in the current status
    pub fn accepts(&self, event: LifecycleEvent) -> bool {
        use LifecycleEvent::*;
        matches!(
            (self.status(), event),
            (TaskStatus::Pending, Enqueue | Cancel)
                | (TaskStatus::Queued, Assign | Block | Cancel)
                | (TaskStatus::Assigned, Start | Requeue | Fail | Cancel)
                | (TaskStatus::Running, Complete | Fail | Requeue | Cancel)
                | (TaskStatus::Failed, Retry)
                | (TaskStatus::Retrying, Enqueue | Cancel)
        )
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("task_id", &self.task_id)
            .field("status", &self.status())
            .finish()
    }
}
