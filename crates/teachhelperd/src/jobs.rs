//! Periodic maintenance jobs run by the daemon.

use std::sync::Arc;

use async_trait::async_trait;
use teachhelper_core::{
    InMemoryTaskTracker, TaskRuntimeManager, TaskStatus, TaskUpdateBroadcaster, METRICS,
};
use tracing::info;

use crate::scheduler::PeriodicJob;

/// Drops finished task records older than the retention window, and the
/// broadcaster's memory of finished tasks.
pub struct PruneFinishedTasks {
    tracker: Arc<InMemoryTaskTracker>,
    updates: Arc<TaskUpdateBroadcaster>,
    retention: chrono::Duration,
}

impl PruneFinishedTasks {
    pub fn new(
        tracker: Arc<InMemoryTaskTracker>,
        updates: Arc<TaskUpdateBroadcaster>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            tracker,
            updates,
            retention,
        }
    }
}

#[async_trait]
impl PeriodicJob for PruneFinishedTasks {
    fn name(&self) -> &str {
        "prune_finished_tasks"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let removed = self.tracker.prune_finished(self.retention).await;
        if removed > 0 {
            info!(removed, "pruned finished task records");
        }
        self.updates.prune_finished();
        Ok(())
    }
}

/// Logs running jobs, task status counts and flushes pipeline counters.
pub struct RuntimeStats {
    runtime: Arc<TaskRuntimeManager>,
    tracker: Arc<InMemoryTaskTracker>,
}

impl RuntimeStats {
    pub fn new(runtime: Arc<TaskRuntimeManager>, tracker: Arc<InMemoryTaskTracker>) -> Self {
        Self { runtime, tracker }
    }
}

#[async_trait]
impl PeriodicJob for RuntimeStats {
    fn name(&self) -> &str {
        "runtime_stats"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let counts = self.tracker.status_counts().await;
        let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);

        info!(
            event = "runtime.stats",
            running_jobs = self.runtime.running_count(),
            pending = count(TaskStatus::Pending),
            running = count(TaskStatus::Running),
            paused = count(TaskStatus::Paused),
            completed = count(TaskStatus::Completed),
            completed_with_errors = count(TaskStatus::CompletedWithErrors),
            failed = count(TaskStatus::Failed),
            cancelled = count(TaskStatus::Cancelled),
        );
        METRICS.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teachhelper_core::{TaskId, TaskTracker};

    fn updates() -> Arc<TaskUpdateBroadcaster> {
        Arc::new(TaskUpdateBroadcaster::new(8))
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_and_active_records() {
        let tracker = Arc::new(InMemoryTaskTracker::new());
        let done = TaskId::new("done").unwrap();
        let active = TaskId::new("active").unwrap();
        tracker.update_progress(&done, 0, 1, TaskStatus::Running).await;
        tracker.update_progress(&done, 1, 1, TaskStatus::Completed).await;
        tracker.update_progress(&active, 0, 1, TaskStatus::Running).await;

        let keep = PruneFinishedTasks::new(
            Arc::clone(&tracker),
            updates(),
            chrono::Duration::hours(1),
        );
        keep.run().await.unwrap();
        assert_eq!(tracker.snapshot().await.len(), 2);

        let drop_all = PruneFinishedTasks::new(
            Arc::clone(&tracker),
            updates(),
            chrono::Duration::seconds(-1),
        );
        drop_all.run().await.unwrap();
        let remaining = tracker.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, active);
    }

    #[tokio::test]
    async fn test_prune_clears_finished_broadcast_state() {
        let tracker = Arc::new(InMemoryTaskTracker::new());
        let updates = updates();
        let done = TaskId::new("done").unwrap();
        updates.update_progress(&done, 1, 1, TaskStatus::Completed).await;

        let prune = PruneFinishedTasks::new(
            tracker,
            Arc::clone(&updates),
            chrono::Duration::hours(1),
        );
        prune.run().await.unwrap();

        assert_eq!(updates.prune_finished(), 0);
    }

    #[tokio::test]
    async fn test_runtime_stats_runs() {
        let tracker = Arc::new(InMemoryTaskTracker::new());
        let runtime = Arc::new(TaskRuntimeManager::new(tracker.clone()));
        let stats = RuntimeStats::new(runtime, tracker);

        assert!(stats.run().await.is_ok());
        assert_eq!(stats.name(), "runtime_stats");
    }
}
