//! Evaluation service: the collaborators a process needs, wired together.
//!
//! Progress from every batch job fans out to the in-memory tracker (task
//! status queries, pruning) and the update broadcaster (real-time clients).
//! The service also owns the task controls: cancel, pause, resume and
//! retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::{BatchConfig, BatchEvaluator, Evaluator, PauseGate};
use crate::error::{BatchEvaluationFailure, Result};
use crate::notify::TaskUpdateBroadcaster;
use crate::obs;
use crate::runtime::TaskRuntimeManager;
use crate::task::{TaskId, TaskStatus};
use crate::tracker::{CompositeTracker, InMemoryTaskTracker, LogLevel, TaskTracker};

type Gates = Arc<Mutex<HashMap<TaskId, PauseGate>>>;

fn lock(gates: &Gates) -> MutexGuard<'_, HashMap<TaskId, PauseGate>> {
    gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a job's pause gate registered for as long as the job exists.
///
/// Dropped with the job future, so finished, panicked and aborted jobs all
/// unregister. A newer gate registered under the same id is left alone.
struct GateRegistration {
    gates: Gates,
    task_id: TaskId,
    gate: PauseGate,
}

impl GateRegistration {
    fn new(gates: Gates, task_id: TaskId, gate: PauseGate) -> Self {
        lock(&gates).insert(task_id.clone(), gate.clone());
        Self {
            gates,
            task_id,
            gate,
        }
    }
}

impl Drop for GateRegistration {
    fn drop(&mut self) {
        let mut gates = lock(&self.gates);
        if gates
            .get(&self.task_id)
            .is_some_and(|g| g.same_gate(&self.gate))
        {
            gates.remove(&self.task_id);
        }
    }
}

pub struct EvaluationService {
    tracker: Arc<InMemoryTaskTracker>,
    updates: Arc<TaskUpdateBroadcaster>,
    sink: Arc<dyn TaskTracker>,
    runtime: Arc<TaskRuntimeManager>,
    gates: Gates,
    config: BatchConfig,
}

impl EvaluationService {
    pub fn new(config: BatchConfig, update_capacity: usize) -> Self {
        let tracker = Arc::new(InMemoryTaskTracker::new());
        let updates = Arc::new(TaskUpdateBroadcaster::new(update_capacity));
        let sink: Arc<dyn TaskTracker> = Arc::new(CompositeTracker::new(vec![
            Arc::clone(&tracker) as Arc<dyn TaskTracker>,
            Arc::clone(&updates) as Arc<dyn TaskTracker>,
        ]));
        let runtime = Arc::new(TaskRuntimeManager::new(Arc::clone(&sink)));

        Self {
            tracker,
            updates,
            sink,
            runtime,
            gates: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Queue a batch under a freshly generated task id.
    pub async fn submit_batch<E>(&self, evaluator: Arc<E>, items: Vec<E::Item>) -> Result<TaskId>
    where
        E: Evaluator + 'static,
        E::Item: 'static,
        E::Output: 'static,
    {
        self.submit_batch_with_id(TaskId::generate(), evaluator, items)
            .await
    }

    /// Queue a batch under a caller-chosen task id.
    ///
    /// Ids already known to the tracker are rejected. The job runs in the
    /// background; its outcome lands in the tracker.
    pub async fn submit_batch_with_id<E>(
        &self,
        task_id: TaskId,
        evaluator: Arc<E>,
        items: Vec<E::Item>,
    ) -> Result<TaskId>
    where
        E: Evaluator + 'static,
        E::Item: 'static,
        E::Output: 'static,
    {
        if !self.tracker.insert_pending(&task_id, items.len()).await {
            return Err(BatchEvaluationFailure::new("task id already in use", task_id).into());
        }
        self.updates
            .update_progress(&task_id, 0, items.len(), TaskStatus::Pending)
            .await;
        self.start(task_id, evaluator, items)
    }

    /// Run a FAILED or CANCELLED task again with `items`.
    ///
    /// The record is reset to PENDING with its counts, failure and result
    /// cleared. Running, unknown and successfully finished tasks are
    /// rejected.
    pub async fn retry_batch<E>(
        &self,
        task_id: TaskId,
        evaluator: Arc<E>,
        items: Vec<E::Item>,
    ) -> Result<TaskId>
    where
        E: Evaluator + 'static,
        E::Item: 'static,
        E::Output: 'static,
    {
        if self.runtime.is_running(&task_id) {
            return Err(BatchEvaluationFailure::new("task is already running", task_id).into());
        }
        let previous = match self.tracker.reopen(&task_id, items.len()).await {
            None => return Err(BatchEvaluationFailure::new("unknown task", task_id).into()),
            Some(status) if !status.is_retryable() => {
                let message = format!("task is {status} and cannot be retried");
                return Err(BatchEvaluationFailure::new(message, task_id).into());
            }
            Some(status) => status,
        };

        obs::emit_task_retried(&task_id, previous);
        self.updates
            .update_progress(&task_id, 0, items.len(), TaskStatus::Pending)
            .await;
        self.start(task_id, evaluator, items)
    }

    fn start<E>(&self, task_id: TaskId, evaluator: Arc<E>, items: Vec<E::Item>) -> Result<TaskId>
    where
        E: Evaluator + 'static,
        E::Item: 'static,
        E::Output: 'static,
    {
        let gate = PauseGate::new();
        let registration =
            GateRegistration::new(Arc::clone(&self.gates), task_id.clone(), gate.clone());
        let batch = BatchEvaluator::new(evaluator, Arc::clone(&self.sink), self.config.clone())
            .with_pause_gate(gate);

        let id = task_id.clone();
        self.runtime.spawn(task_id.clone(), async move {
            let _registration = registration;
            batch.run(&id, items).await.map(|_| ())
        })?;
        Ok(task_id)
    }

    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        self.runtime.cancel(task_id).await
    }

    /// Pause a RUNNING batch.
    ///
    /// Evaluations in flight finish; no new attempt starts until
    /// [`EvaluationService::resume`]. Returns false if the task is not
    /// running or already paused.
    pub async fn pause(&self, task_id: &TaskId) -> bool {
        let Some(gate) = self.gate(task_id) else {
            return false;
        };
        let running = self
            .tracker
            .get(task_id)
            .await
            .is_some_and(|r| r.status == TaskStatus::Running);
        if !running || !gate.pause() {
            return false;
        }

        obs::emit_task_paused(task_id);
        self.sink.update_status(task_id, TaskStatus::Paused).await;
        self.sink
            .add_log(task_id, LogLevel::Info, "task paused")
            .await;
        true
    }

    /// Resume a paused batch. Returns false if it was not paused.
    pub async fn resume(&self, task_id: &TaskId) -> bool {
        let Some(gate) = self.gate(task_id) else {
            return false;
        };
        if !gate.resume() {
            return false;
        }

        obs::emit_task_resumed(task_id);
        self.sink.update_status(task_id, TaskStatus::Running).await;
        self.sink
            .add_log(task_id, LogLevel::Info, "task resumed")
            .await;
        true
    }

    fn gate(&self, task_id: &TaskId) -> Option<PauseGate> {
        lock(&self.gates).get(task_id).cloned()
    }

    pub fn tracker(&self) -> &Arc<InMemoryTaskTracker> {
        &self.tracker
    }

    pub fn updates(&self) -> &Arc<TaskUpdateBroadcaster> {
        &self.updates
    }

    pub fn runtime(&self) -> &Arc<TaskRuntimeManager> {
        &self.runtime
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}
