//! Task journal
//!
//! Task records written to a file after every status change, so replays and
//! crash recovery survive a restart that was not a clean shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error};

use cse_agent::tracker::{BeginOutcome, NewTask};
use cse_agent::{InMemoryTaskTracker, OperationTask, TaskResult, TaskTracker};
use cse_common::{ErrorDetail, Result};

/// JSON file holding every task record
#[derive(Clone, Debug)]
pub struct TaskJournal {
    path: PathBuf,
}

impl TaskJournal {
    /// Journal stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved records; a missing file is an empty journal
    pub async fn load(&self) -> anyhow::Result<Vec<OperationTask>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("task journal {} is not valid", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read task journal {}", self.path.display())),
        }
    }

    /// Replace the journal with `tasks`
    ///
    /// Written to a sibling file and renamed over the journal, so a crash
    /// mid-write leaves the previous version intact.
    pub async fn save(&self, tasks: &[OperationTask]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(tasks)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("failed to write task journal {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace task journal {}", self.path.display()))
    }
}

/// In-memory tracker that saves its records after every status change
pub struct JournaledTracker {
    inner: Arc<InMemoryTaskTracker>,
    journal: TaskJournal,
    writes: Mutex<()>,
}

impl JournaledTracker {
    /// Wrap `inner`, saving to `journal`
    pub fn new(inner: Arc<InMemoryTaskTracker>, journal: TaskJournal) -> Self {
        Self {
            inner,
            journal,
            writes: Mutex::new(()),
        }
    }

    /// Save the current records
    ///
    /// The live records stay authoritative if the write fails.
    async fn persist(&self) {
        let _guard = self.writes.lock().await;
        let tasks = self.inner.snapshot();
        match self.journal.save(&tasks).await {
            Ok(()) => debug!(tasks = tasks.len(), "task journal saved"),
            Err(e) => error!(
                path = %self.journal.path().display(),
                error = ?e,
                "failed to save task journal"
            ),
        }
    }
}

#[async_trait]
impl TaskTracker for JournaledTracker {
    async fn begin_or_get_existing(&self, task: NewTask) -> Result<BeginOutcome> {
        let outcome = self.inner.begin_or_get_existing(task).await?;
        if outcome.fresh {
            self.persist().await;
        }
        Ok(outcome)
    }

    async fn mark_in_progress(&self, task_id: &str) -> Result<OperationTask> {
        let task = self.inner.mark_in_progress(task_id).await?;
        self.persist().await;
        Ok(task)
    }

    async fn mark_succeeded(&self, task_id: &str, result: TaskResult) -> Result<OperationTask> {
        let task = self.inner.mark_succeeded(task_id, result).await?;
        self.persist().await;
        Ok(task)
    }

    async fn mark_failed(&self, task_id: &str, error: ErrorDetail) -> Result<OperationTask> {
        let task = self.inner.mark_failed(task_id, error).await?;
        self.persist().await;
        Ok(task)
    }

    async fn release(&self, task_id: &str) -> Result<()> {
        // Claims are not journaled
        self.inner.release(task_id).await
    }

    async fn lookup(&self, task_id: &str) -> Result<OperationTask> {
        self.inner.lookup(task_id).await
    }

    async fn active_for_entity(&self, entity_id: &str) -> Result<Vec<OperationTask>> {
        self.inner.active_for_entity(entity_id).await
    }
}
