//! Task lifecycle tracking
//!
//! Every behavior invocation is recorded as an [`OperationTask`] keyed by the
//! caller's task id. The tracker is the idempotency gate of the dispatcher:
//!
//! ```text
//! received ──> in-progress ──> succeeded
//!    │              │
//!    └──────────────┴────────> failed
//! ```
//!
//! Terminal states have no outgoing transitions. A task is "claimed" by the
//! dispatch that began it; a second begin for a claimed or terminal task
//! returns `fresh = false` so at most one execution is active per task id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use cse_common::{Error, ErrorDetail, Result};

/// Status of an operation task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Accepted, handler not started
    Received,
    /// Handler running
    InProgress,
    /// Handler finished; the result may carry a degradation caveat
    Succeeded,
    /// Handler failed or the message was rejected
    Failed,
}

impl TaskStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::InProgress)
                | (Self::Received, Self::Failed)
                | (Self::InProgress, Self::Succeeded)
                | (Self::InProgress, Self::Failed)
        )
    }

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result recorded for a succeeded task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Handler output
    pub payload: Value,
    /// Present when the task completed with caveats (a partial failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<ErrorDetail>,
}

impl TaskResult {
    /// Clean result
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            degraded: None,
        }
    }

    /// Result of an operation that completed but not fully
    pub fn degraded(payload: Value, caveat: &Error) -> Self {
        Self {
            payload,
            degraded: Some(caveat.detail()),
        }
    }

    /// Whether a caveat is attached
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Identity of a task being begun
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    /// Caller-supplied task id
    pub task_id: String,
    /// Behavior id as received
    pub behavior_id: String,
    /// Target entity
    pub entity_id: String,
}

/// One invocation of a behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTask {
    /// Caller-supplied task id
    pub task_id: String,
    /// Behavior id as received
    pub behavior_id: String,
    /// Target entity
    pub entity_id: String,
    /// Current status
    pub status: TaskStatus,
    /// Result, once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Error detail, once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Every status the task has been in, oldest first
    pub history: Vec<TaskStatus>,
    /// When the task was first received
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OperationTask {
    /// Fresh task in the received state
    pub fn received(new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            task_id: new.task_id,
            behavior_id: new.behavior_id,
            entity_id: new.entity_id,
            status: TaskStatus::Received,
            result: None,
            error: None,
            history: vec![TaskStatus::Received],
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the task reached a final status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the task ever entered `status`
    pub fn passed_through(&self, status: TaskStatus) -> bool {
        self.history.contains(&status)
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::fatal_with_context(
                "task-tracker",
                format!(
                    "task {} cannot move from {} to {}",
                    self.task_id, self.status, next
                ),
            ));
        }
        let now = Utc::now();
        self.status = next;
        self.history.push(next);
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

/// Outcome of the idempotency gate
#[derive(Clone, Debug, PartialEq)]
pub struct BeginOutcome {
    /// True when the caller won the gate and must run the handler
    pub fresh: bool,
    /// Task as recorded after the gate
    pub task: OperationTask,
}

/// Trait abstracting task record storage
///
/// Allows the dispatcher to be tested with mock trackers while the agent uses
/// the in-memory implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Record a task, or return the existing record
    ///
    /// `fresh` is true for a new task and for a non-terminal task nobody is
    /// executing (crash recovery). It is false for terminal tasks and for
    /// tasks another dispatch is currently executing.
    async fn begin_or_get_existing(&self, task: NewTask) -> Result<BeginOutcome>;

    /// Move a task to in-progress; a no-op if it already is
    async fn mark_in_progress(&self, task_id: &str) -> Result<OperationTask>;

    /// Record success
    async fn mark_succeeded(&self, task_id: &str, result: TaskResult) -> Result<OperationTask>;

    /// Record failure
    async fn mark_failed(&self, task_id: &str, error: ErrorDetail) -> Result<OperationTask>;

    /// Give up the execution claim on a non-terminal task
    async fn release(&self, task_id: &str) -> Result<()>;

    /// Look a task up by id
    async fn lookup(&self, task_id: &str) -> Result<OperationTask>;

    /// Non-terminal tasks on an entity that some dispatch is executing
    async fn active_for_entity(&self, entity_id: &str) -> Result<Vec<OperationTask>>;
}

struct TrackedTask {
    task: OperationTask,
    claimed: bool,
}

/// Task tracker holding records in process memory
#[derive(Default)]
pub struct InMemoryTaskTracker {
    tasks: DashMap<String, TrackedTask>,
}

impl InMemoryTaskTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload records saved before a restart
    ///
    /// Restored tasks carry no execution claim, so non-terminal ones are
    /// handed out again by the next begin for their id.
    pub fn restore(&self, tasks: impl IntoIterator<Item = OperationTask>) {
        for task in tasks {
            debug!(task_id = %task.task_id, status = %task.status, "restoring task");
            self.tasks.insert(
                task.task_id.clone(),
                TrackedTask {
                    task,
                    claimed: false,
                },
            );
        }
    }

    /// Copy of every record, for persistence
    pub fn snapshot(&self) -> Vec<OperationTask> {
        self.tasks.iter().map(|t| t.task.clone()).collect()
    }

    fn update<F>(&self, task_id: &str, apply: F) -> Result<OperationTask>
    where
        F: FnOnce(&mut TrackedTask) -> Result<()>,
    {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        apply(&mut *entry)?;
        Ok(entry.task.clone())
    }
}

#[async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn begin_or_get_existing(&self, new: NewTask) -> Result<BeginOutcome> {
        match self.tasks.entry(new.task_id.clone()) {
            Entry::Vacant(slot) => {
                let task = OperationTask::received(new);
                slot.insert(TrackedTask {
                    task: task.clone(),
                    claimed: true,
                });
                Ok(BeginOutcome { fresh: true, task })
            }
            Entry::Occupied(mut slot) => {
                let tracked = slot.get_mut();
                if tracked.task.behavior_id != new.behavior_id
                    || tracked.task.entity_id != new.entity_id
                {
                    warn!(
                        task_id = %new.task_id,
                        recorded_behavior = %tracked.task.behavior_id,
                        received_behavior = %new.behavior_id,
                        "task id reused with different headers, answering from the record"
                    );
                }
                let fresh = !tracked.task.is_terminal() && !tracked.claimed;
                if fresh {
                    tracked.claimed = true;
                }
                Ok(BeginOutcome {
                    fresh,
                    task: tracked.task.clone(),
                })
            }
        }
    }

    async fn mark_in_progress(&self, task_id: &str) -> Result<OperationTask> {
        self.update(task_id, |tracked| {
            if tracked.task.status == TaskStatus::InProgress {
                return Ok(());
            }
            tracked.task.transition(TaskStatus::InProgress)
        })
    }

    async fn mark_succeeded(&self, task_id: &str, result: TaskResult) -> Result<OperationTask> {
        self.update(task_id, |tracked| {
            tracked.task.transition(TaskStatus::Succeeded)?;
            tracked.task.result = Some(result);
            tracked.claimed = false;
            Ok(())
        })
    }

    async fn mark_failed(&self, task_id: &str, error: ErrorDetail) -> Result<OperationTask> {
        self.update(task_id, |tracked| {
            tracked.task.transition(TaskStatus::Failed)?;
            tracked.task.error = Some(error);
            tracked.claimed = false;
            Ok(())
        })
    }

    async fn release(&self, task_id: &str) -> Result<()> {
        self.update(task_id, |tracked| {
            tracked.claimed = false;
            Ok(())
        })
        .map(|_| ())
    }

    async fn lookup(&self, task_id: &str) -> Result<OperationTask> {
        self.tasks
            .get(task_id)
            .map(|t| t.task.clone())
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    async fn active_for_entity(&self, entity_id: &str) -> Result<Vec<OperationTask>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.claimed && t.task.entity_id == entity_id && !t.task.is_terminal())
            .map(|t| t.task.clone())
            .collect())
    }
}
