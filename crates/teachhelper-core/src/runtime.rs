//! Registry of running batch jobs.
//!
//! Jobs are spawned on the tokio runtime under their [`TaskId`]. A job
//! that ends in error or panics goes through [`report_failure`] so its task
//! is marked failed; only then does it remove itself from the registry.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::task::AbortHandle;
use tracing::{debug, error, Instrument};

use crate::error::{BatchEvaluationFailure, EvaluationError, Result};
use crate::obs;
use crate::task::{TaskId, TaskStatus};
use crate::tracker::{report_failure, LogLevel, TaskTracker};

struct RunningTask {
    /// Distinguishes re-registrations of the same id.
    generation: u64,
    handle: AbortHandle,
}

type Registry = Arc<Mutex<HashMap<TaskId, RunningTask>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<TaskId, RunningTask>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Make sure a job's failure names the job's own task.
fn correlate(err: EvaluationError, task_id: &TaskId) -> EvaluationError {
    match err {
        EvaluationError::Batch(failure) if failure.task_id() == task_id => failure.into(),
        EvaluationError::Batch(failure) => {
            let message = failure.message().to_string();
            BatchEvaluationFailure::with_cause(message, task_id.clone(), failure).into()
        }
        EvaluationError::Evaluation(failure) => {
            BatchEvaluationFailure::with_cause("batch job failed", task_id.clone(), failure).into()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

pub struct TaskRuntimeManager {
    tasks: Registry,
    next_generation: AtomicU64,
    tracker: Arc<dyn TaskTracker>,
}

impl TaskRuntimeManager {
    pub fn new(tracker: Arc<dyn TaskTracker>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            tracker,
        }
    }

    /// Spawn `job` and register it under `task_id`.
    ///
    /// Must be called from within a tokio runtime. Fails if a job with the
    /// same id is still running. Whatever ends the job abnormally is
    /// reported as a batch failure for `task_id`: an
    /// [`EvaluationError::Evaluation`], a batch failure naming another task
    /// (kept as cause) or a panic.
    pub fn spawn<F>(&self, task_id: TaskId, job: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        if tasks
            .get(&task_id)
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Err(BatchEvaluationFailure::new("task is already running", task_id).into());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.tasks);
        let tracker = Arc::clone(&self.tracker);
        let id = task_id.clone();
        let span = obs::task_span(&task_id);

        let handle = tokio::spawn(
            async move {
                let failure = match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(correlate(err, &id)),
                    Err(panic) => {
                        error!(
                            task_id = %id,
                            panic = panic_message(panic.as_ref()),
                            "batch job panicked"
                        );
                        let failure = BatchEvaluationFailure::new("batch job panicked", id.clone());
                        Some(failure.into())
                    }
                };
                if let Some(err) = failure {
                    report_failure(tracker.as_ref(), &err).await;
                }

                let mut tasks = lock(&registry);
                if tasks.get(&id).is_some_and(|t| t.generation == generation) {
                    tasks.remove(&id);
                }
            }
            .instrument(span),
        );

        debug!(task_id = %task_id, generation, "registered task");
        tasks.insert(
            task_id,
            RunningTask {
                generation,
                handle: handle.abort_handle(),
            },
        );
        Ok(())
    }

    /// Abort a running job and mark its task cancelled.
    ///
    /// Returns false if no job with that id is running.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let removed = lock(&self.tasks).remove(task_id);
        let Some(running) = removed else {
            return false;
        };
        if running.handle.is_finished() {
            return false;
        }

        running.handle.abort();
        obs::emit_task_cancelled(task_id);
        self.tracker
            .update_status(task_id, TaskStatus::Cancelled)
            .await;
        self.tracker
            .add_log(task_id, LogLevel::Warn, "task cancelled")
            .await;
        true
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        lock(&self.tasks)
            .get(task_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn running_count(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Ids of running jobs, sorted.
    pub fn running_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = lock(&self.tasks)
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
