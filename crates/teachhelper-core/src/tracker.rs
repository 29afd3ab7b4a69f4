//! Task progress tracking and the failure boundary handler.
//!
//! A [`TaskTracker`] is the sink batch jobs report progress, log lines and
//! final results to. [`report_failure`] is the boundary where pipeline
//! errors end up: batch failures mark their correlated task failed,
//! evaluation failures are logged with their full cause chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::batch::BatchEvaluationResult;
use crate::error::{Escalation, EvaluationError};
use crate::obs;
use crate::task::{TaskId, TaskStatus};

/// Severity of a task log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A single line in a task's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Tracked state of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub processed: usize,
    pub total: usize,
    pub logs: Vec<TaskLogEntry>,
    /// Message of the failure that ended the task, if any.
    pub failure: Option<String>,
    /// Final batch summary, once the job finished.
    pub result: Option<BatchEvaluationResult>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            processed: 0,
            total: 0,
            logs: Vec::new(),
            failure: None,
            result: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply a status change if the lifecycle allows it.
    fn transition(&mut self, status: TaskStatus) -> bool {
        if !self.status.can_transition_to(status) {
            warn!(
                task_id = %self.task_id,
                current = %self.status,
                requested = %status,
                "ignoring invalid task status transition"
            );
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }

    fn push_log(&mut self, level: LogLevel, message: &str) {
        let now = Utc::now();
        self.logs.push(TaskLogEntry {
            level,
            message: message.to_string(),
            timestamp: now,
        });
        self.updated_at = now;
    }
}

/// Sink for batch job progress.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Report processed/total counts together with the current status.
    async fn update_progress(
        &self,
        task_id: &TaskId,
        processed: usize,
        total: usize,
        status: TaskStatus,
    );

    /// Change the status only, keeping the last reported counts.
    async fn update_status(&self, task_id: &TaskId, status: TaskStatus);

    async fn add_log(&self, task_id: &TaskId, level: LogLevel, message: &str);

    /// Mark the task failed with the message of the failure that ended it.
    async fn mark_failed(&self, task_id: &TaskId, message: &str);

    /// Store the final summary of a batch job.
    async fn record_result(&self, _task_id: &TaskId, _result: &BatchEvaluationResult) {}
}

/// Handle an error that reached the top of the pipeline.
pub async fn report_failure(tracker: &dyn TaskTracker, error: &EvaluationError) {
    match error.escalation() {
        Escalation::EscalateWithCorrelation(task_id) => {
            obs::emit_batch_failed(&task_id, error);
            tracker.mark_failed(&task_id, error.message()).await;
        }
        Escalation::Localized => obs::emit_evaluation_failed(error),
    }
}

/// Tracker keeping task records in memory.
#[derive(Default)]
pub struct InMemoryTaskTracker {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.records.read().await.get(task_id).cloned()
    }

    /// All records, ordered by task id.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }

    /// Number of records per status.
    pub async fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Create a PENDING record for a new task.
    ///
    /// Returns false, leaving the tracker untouched, if the id is already
    /// tracked.
    pub async fn insert_pending(&self, task_id: &TaskId, total: usize) -> bool {
        let mut records = self.records.write().await;
        if records.contains_key(task_id) {
            return false;
        }
        let mut record = TaskRecord::new(task_id.clone());
        record.total = total;
        records.insert(task_id.clone(), record);
        true
    }

    /// Reset a FAILED or CANCELLED record to PENDING for another run.
    ///
    /// Counts, failure and result are cleared; the log is kept. Returns the
    /// status the record had, or `None` if the id is unknown. The record is
    /// only changed when that status is retryable.
    pub async fn reopen(&self, task_id: &TaskId, total: usize) -> Option<TaskStatus> {
        let mut records = self.records.write().await;
        let record = records.get_mut(task_id)?;
        let previous = record.status;
        if record.transition(TaskStatus::Pending) {
            record.processed = 0;
            record.total = total;
            record.failure = None;
            record.result = None;
            record.push_log(LogLevel::Info, &format!("task reset for retry after {previous}"));
        }
        Some(previous)
    }

    /// Drop finished records not updated within `retention`.
    ///
    /// Returns how many records were removed.
    pub async fn prune_finished(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.updated_at < cutoff));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "pruned finished task records");
        }
        removed
    }
}

#[async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn update_progress(
        &self,
        task_id: &TaskId,
        processed: usize,
        total: usize,
        status: TaskStatus,
    ) {
        let mut records = self.records.write().await;
        let record = records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id.clone()));

        if record.transition(status) {
            record.processed = processed;
            record.total = total;
        }
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) {
        let mut records = self.records.write().await;
        records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id.clone()))
            .transition(status);
    }

    async fn add_log(&self, task_id: &TaskId, level: LogLevel, message: &str) {
        let mut records = self.records.write().await;
        records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id.clone()))
            .push_log(level, message);
    }

    async fn mark_failed(&self, task_id: &TaskId, message: &str) {
        let mut records = self.records.write().await;
        let record = records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id.clone()));

        if record.status != TaskStatus::Failed {
            if !record.status.can_transition_to(TaskStatus::Failed) {
                warn!(
                    task_id = %task_id,
                    current = %record.status,
                    "cannot mark finished task as failed"
                );
                return;
            }
            record.status = TaskStatus::Failed;
        }
        record.failure = Some(message.to_string());
        record.push_log(LogLevel::Error, message);
    }

    async fn record_result(&self, task_id: &TaskId, result: &BatchEvaluationResult) {
        let mut records = self.records.write().await;
        let record = records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id.clone()));
        record.result = Some(result.clone());
        record.updated_at = Utc::now();
    }
}

/// Forwards every report to each inner tracker in order.
pub struct CompositeTracker {
    trackers: Vec<Arc<dyn TaskTracker>>,
}

impl CompositeTracker {
    pub fn new(trackers: Vec<Arc<dyn TaskTracker>>) -> Self {
        Self { trackers }
    }
}

#[async_trait]
impl TaskTracker for CompositeTracker {
    async fn update_progress(
        &self,
        task_id: &TaskId,
        processed: usize,
        total: usize,
        status: TaskStatus,
    ) {
        for tracker in &self.trackers {
            tracker.update_progress(task_id, processed, total, status).await;
        }
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) {
        for tracker in &self.trackers {
            tracker.update_status(task_id, status).await;
        }
    }

    async fn add_log(&self, task_id: &TaskId, level: LogLevel, message: &str) {
        for tracker in &self.trackers {
            tracker.add_log(task_id, level, message).await;
        }
    }

    async fn mark_failed(&self, task_id: &TaskId, message: &str) {
        for tracker in &self.trackers {
            tracker.mark_failed(task_id, message).await;
        }
    }

    async fn record_result(&self, task_id: &TaskId, result: &BatchEvaluationResult) {
        for tracker in &self.trackers {
            tracker.record_result(task_id, result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BatchEvaluationFailure, EvaluationFailure};

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_progress_creates_and_updates_record() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-1");

        tracker.update_progress(&task, 0, 10, TaskStatus::Running).await;
        tracker.update_progress(&task, 4, 10, TaskStatus::Running).await;

        let record = tracker.get(&task).await.expect("record");
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.processed, 4);
        assert_eq!(record.total, 10);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_ignored() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-2");

        tracker.update_progress(&task, 0, 2, TaskStatus::Running).await;
        tracker.update_progress(&task, 2, 2, TaskStatus::Completed).await;
        tracker.update_progress(&task, 1, 2, TaskStatus::Running).await;

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.processed, 2);
    }

    #[tokio::test]
    async fn test_mark_failed_records_message_and_log() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-3");

        tracker.update_progress(&task, 1, 5, TaskStatus::Running).await;
        tracker.mark_failed(&task, "scorer unavailable").await;

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("scorer unavailable"));
        assert_eq!(record.logs.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_mark_failed_does_not_reopen_completed_task() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-4");

        tracker.update_progress(&task, 0, 1, TaskStatus::Running).await;
        tracker.update_progress(&task, 1, 1, TaskStatus::Completed).await;
        tracker.mark_failed(&task, "late failure").await;

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.failure.is_none());
    }

    #[tokio::test]
    async fn test_report_failure_marks_correlated_task() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-42");
        tracker.update_progress(&task, 0, 3, TaskStatus::Running).await;

        let err: EvaluationError =
            BatchEvaluationFailure::new("partial failure", task.clone()).into();
        report_failure(&tracker, &err).await;

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("partial failure"));
    }

    #[tokio::test]
    async fn test_report_failure_leaves_tracker_alone_for_local_failure() {
        let tracker = InMemoryTaskTracker::new();
        let err: EvaluationError = EvaluationFailure::new("answer unreadable").into();
        report_failure(&tracker, &err).await;
        assert!(tracker.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_only_removes_finished_records() {
        let tracker = InMemoryTaskTracker::new();
        let running = id("running");
        let done = id("done");

        tracker.update_progress(&running, 0, 1, TaskStatus::Running).await;
        tracker.update_progress(&done, 0, 1, TaskStatus::Running).await;
        tracker.update_progress(&done, 1, 1, TaskStatus::Completed).await;

        assert_eq!(tracker.prune_finished(chrono::Duration::hours(1)).await, 0);
        assert_eq!(tracker.prune_finished(chrono::Duration::seconds(-1)).await, 1);

        assert!(tracker.get(&running).await.is_some());
        assert!(tracker.get(&done).await.is_none());
    }

    #[tokio::test]
    async fn test_composite_forwards_to_all() {
        let a = Arc::new(InMemoryTaskTracker::new());
        let b = Arc::new(InMemoryTaskTracker::new());
        let composite = CompositeTracker::new(vec![
            a.clone() as Arc<dyn TaskTracker>,
            b.clone() as Arc<dyn TaskTracker>,
        ]);
        let task = id("batch-5");

        composite.add_log(&task, LogLevel::Info, "started").await;

        assert_eq!(a.get(&task).await.unwrap().logs.len(), 1);
        assert_eq!(b.get(&task).await.unwrap().logs.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_pending_refuses_known_ids() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-6");

        assert!(tracker.insert_pending(&task, 5).await);
        assert!(!tracker.insert_pending(&task, 9).await);

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.total, 5);
    }

    #[tokio::test]
    async fn test_reopen_resets_failed_record() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-7");
        tracker.update_progress(&task, 2, 4, TaskStatus::Running).await;
        tracker.mark_failed(&task, "scorer unavailable").await;

        assert_eq!(tracker.reopen(&task, 6).await, Some(TaskStatus::Failed));

        let record = tracker.get(&task).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.processed, 0);
        assert_eq!(record.total, 6);
        assert!(record.failure.is_none());
        assert_eq!(
            record.logs.last().unwrap().message,
            "task reset for retry after FAILED"
        );
    }

    #[tokio::test]
    async fn test_reopen_leaves_completed_record_alone() {
        let tracker = InMemoryTaskTracker::new();
        let task = id("batch-8");
        tracker.update_progress(&task, 0, 1, TaskStatus::Running).await;
        tracker.update_progress(&task, 1, 1, TaskStatus::Completed).await;

        assert_eq!(tracker.reopen(&task, 1).await, Some(TaskStatus::Completed));
        assert_eq!(tracker.get(&task).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(tracker.reopen(&id("unknown"), 1).await, None);
    }
}
