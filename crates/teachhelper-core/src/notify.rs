//! Task update notifications for real-time clients.
//!
//! [`TaskUpdateBroadcaster`] fans [`TaskUpdate`]s out to subscribers over a
//! tokio broadcast channel. The socket layer that pushes them to browsers
//! lives outside this crate; it subscribes here and forwards
//! [`TaskUpdate::to_json`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::task::{TaskId, TaskStatus};
use crate::tracker::{LogLevel, TaskTracker};

/// Task type reported for batch evaluation jobs.
pub const BATCH_EVALUATION: &str = "BATCH_EVALUATION";

/// Message pushed to clients when a task changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Whole percent, 0..=100.
    pub progress: u8,
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TaskUpdate {
    pub fn new(task_id: TaskId, status: TaskStatus, progress: u8, kind: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            progress: progress.min(100),
            kind: kind.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Whole-percent progress; an empty task counts as done.
pub fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.min(total) * 100 / total) as u8
}

/// Last update published for a task.
#[derive(Debug, Clone, Copy)]
struct LastUpdate {
    status: TaskStatus,
    progress: u8,
}

pub struct TaskUpdateBroadcaster {
    sender: broadcast::Sender<TaskUpdate>,
    kind: String,
    last: Mutex<HashMap<TaskId, LastUpdate>>,
}

impl TaskUpdateBroadcaster {
    /// `capacity` bounds how many updates a slow subscriber may lag behind.
    pub fn new(capacity: usize) -> Self {
        Self::with_kind(capacity, BATCH_EVALUATION)
    }

    pub fn with_kind(capacity: usize, kind: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            kind: kind.into(),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Send an update to every subscriber; returns how many received it.
    pub fn publish(&self, update: TaskUpdate) -> usize {
        match self.sender.send(update) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("task update dropped, no subscribers");
                0
            }
        }
    }

    /// Forget finished tasks; returns how many were dropped.
    ///
    /// Until then a finished task only accepts the retry reset, so late
    /// reports cannot send clients a second final status.
    pub fn prune_finished(&self) -> usize {
        let mut last = self.lock_last();
        let before = last.len();
        last.retain(|_, update| !update.status.is_terminal());
        before - last.len()
    }

    fn lock_last(&self) -> MutexGuard<'_, HashMap<TaskId, LastUpdate>> {
        self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the update and return the progress to publish, or `None` if a
    /// finished task cannot take `status`.
    fn remember(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> Option<u8> {
        let mut last = self.lock_last();
        let previous = last.get(task_id).copied();
        if let Some(prev) = previous {
            if prev.status.is_terminal() && !prev.status.can_transition_to(status) {
                trace!(
                    task_id = %task_id,
                    status = %status,
                    "skipping update for finished task"
                );
                return None;
            }
        }

        let progress = progress
            .or(previous.map(|prev| prev.progress))
            .unwrap_or(0);
        last.insert(task_id.clone(), LastUpdate { status, progress });
        Some(progress)
    }

    fn emit(&self, task_id: &TaskId, status: TaskStatus, progress: Option<u8>) {
        if let Some(progress) = self.remember(task_id, status, progress) {
            let update = TaskUpdate::new(task_id.clone(), status, progress, self.kind.clone());
            self.publish(update);
        }
    }
}

#[async_trait]
impl TaskTracker for TaskUpdateBroadcaster {
    async fn update_progress(
        &self,
        task_id: &TaskId,
        processed: usize,
        total: usize,
        status: TaskStatus,
    ) {
        self.emit(task_id, status, Some(percent(processed, total)));
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) {
        self.emit(task_id, status, None);
    }

    async fn add_log(&self, _task_id: &TaskId, _level: LogLevel, _message: &str) {}

    async fn mark_failed(&self, task_id: &TaskId, _message: &str) {
        self.emit(task_id, TaskStatus::Failed, None);
    }
}
