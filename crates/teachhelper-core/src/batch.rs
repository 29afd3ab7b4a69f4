//! Batch evaluation execution.
//!
//! [`BatchEvaluator`] runs a caller-supplied [`Evaluator`] over every item
//! of a batch:
//! - items run concurrently, bounded by `BatchConfig::max_concurrency`
//! - each item is retried with linear backoff per [`RetryPolicy`]
//! - progress and log lines go to the [`TaskTracker`] after every item
//! - a [`PauseGate`] holds back new attempts while the batch is paused
//! - item failures stay local to the item; the batch only fails when it
//!   had nothing to evaluate or every item failed

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};

use crate::error::{BatchEvaluationFailure, EvaluationFailure, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::task::{TaskId, TaskStatus};
use crate::tracker::{LogLevel, TaskTracker};

/// Single-item evaluation, supplied by the caller.
#[async_trait]
pub trait Evaluator: Send + Sync {
    type Item: Send + Sync;
    type Output: Send;

    /// Short label for an item in logs, e.g. `answer 17`.
    fn describe(&self, item: &Self::Item) -> String;

    async fn evaluate(
        &self,
        item: &Self::Item,
    ) -> std::result::Result<Self::Output, EvaluationFailure>;
}

/// Per-item retry behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Base delay; the wait after attempt `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after `attempt` failed attempts.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Pause switch shared by a running batch and whoever controls it.
///
/// While paused, evaluations already in flight finish but no new attempt
/// starts. Clones share the same switch.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }

    /// Returns false if the gate was already paused.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns false if the gate was not paused.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Whether both handles control the same switch.
    pub fn same_gate(&self, other: &PauseGate) -> bool {
        Arc::ptr_eq(&self.paused, &other.paused)
    }

    /// Wait until the gate is open. Returns at once if it is.
    pub async fn wait_resumed(&self) {
        let mut rx = self.paused.subscribe();
        // The sender is owned by `self`, so the channel stays open.
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    fn running_status(&self) -> TaskStatus {
        if self.is_paused() {
            TaskStatus::Paused
        } else {
            TaskStatus::Running
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEvaluationResult {
    pub task_id: TaskId,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// One line per failed item.
    pub errors: Vec<String>,
    pub status: TaskStatus,
}

impl BatchEvaluationResult {
    pub fn new(task_id: TaskId, total: usize) -> Self {
        Self {
            task_id,
            total,
            successful: 0,
            failed: 0,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn record_success(&mut self) {
        self.successful += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed += 1;
        self.errors.push(error.into());
    }

    /// Percentage of items that succeeded, 0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64 * 100.0
    }

    /// Percentage of items processed, 100 for an empty batch.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.successful + self.failed) as f64 / self.total as f64 * 100.0
    }

    /// Wall time in milliseconds; 0 until both timestamps are set.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Status a finished batch ends in.
    pub fn final_status(&self) -> TaskStatus {
        if self.failed == 0 {
            TaskStatus::Completed
        } else if self.successful > 0 {
            TaskStatus::CompletedWithErrors
        } else {
            TaskStatus::Failed
        }
    }
}

/// Result of a batch that produced at least one output.
#[derive(Debug)]
pub struct BatchOutcome<O> {
    pub result: BatchEvaluationResult,
    /// Outputs in input order; `None` where the item failed.
    pub outputs: Vec<Option<O>>,
}

/// Runs an [`Evaluator`] over batches and reports to a [`TaskTracker`].
pub struct BatchEvaluator<E: Evaluator> {
    evaluator: Arc<E>,
    tracker: Arc<dyn TaskTracker>,
    config: BatchConfig,
    gate: PauseGate,
}

impl<E: Evaluator> BatchEvaluator<E> {
    pub fn new(evaluator: Arc<E>, tracker: Arc<dyn TaskTracker>, config: BatchConfig) -> Self {
        Self {
            evaluator,
            tracker,
            config,
            gate: PauseGate::new(),
        }
    }

    /// Run under an externally controlled pause switch.
    pub fn with_pause_gate(mut self, gate: PauseGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn pause_gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Evaluate every item under `task_id`.
    ///
    /// Fails with a [`BatchEvaluationFailure`] carrying `task_id` when the
    /// batch is empty or no item succeeded. In the latter case the last
    /// item failure is attached as cause.
    pub async fn run(
        &self,
        task_id: &TaskId,
        items: Vec<E::Item>,
    ) -> Result<BatchOutcome<E::Output>> {
        let total = items.len();
        let mut result = BatchEvaluationResult::new(task_id.clone(), total);
        result.started_at = Some(Utc::now());

        if items.is_empty() {
            self.tracker
                .update_progress(task_id, 0, 0, TaskStatus::Failed)
                .await;
            self.tracker
                .add_log(task_id, LogLevel::Error, "no items to evaluate")
                .await;
            METRICS.inc_batches_failed();
            return Err(BatchEvaluationFailure::new("no items to evaluate", task_id.clone()).into());
        }

        let concurrency = self.config.max_concurrency.max(1);
        METRICS.inc_batches_started();
        obs::emit_batch_started(task_id, total, concurrency);
        self.tracker
            .update_progress(task_id, 0, total, TaskStatus::Running)
            .await;
        self.tracker
            .add_log(
                task_id,
                LogLevel::Info,
                &format!("starting batch evaluation of {total} items, concurrency {concurrency}"),
            )
            .await;

        let semaphore = Semaphore::new(concurrency);
        let processed = AtomicUsize::new(0);
        let outcomes = futures::future::join_all(
            items
                .iter()
                .map(|item| self.evaluate_item(task_id, item, &semaphore, &processed, total)),
        )
        .await;

        let mut outputs = Vec::with_capacity(total);
        let mut last_failure = None;
        for (label, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    result.record_success();
                    outputs.push(Some(output));
                }
                Err(failure) => {
                    result.record_failure(format!("{label}: {failure}"));
                    outputs.push(None);
                    last_failure = Some(failure);
                }
            }
        }

        result.finished_at = Some(Utc::now());
        result.status = result.final_status();

        self.tracker
            .update_progress(task_id, total, total, result.status)
            .await;
        self.tracker
            .add_log(
                task_id,
                LogLevel::Info,
                &format!(
                    "batch evaluation finished: total {}, succeeded {}, failed {}",
                    total, result.successful, result.failed
                ),
            )
            .await;
        self.tracker.record_result(task_id, &result).await;
        obs::emit_batch_finished(
            task_id,
            result.status,
            result.successful,
            result.failed,
            result.duration_ms(),
        );

        if result.successful == 0 {
            METRICS.inc_batches_failed();
            let message = format!("all {total} evaluations failed");
            let failure = match last_failure {
                Some(cause) => BatchEvaluationFailure::with_cause(message, task_id.clone(), cause),
                None => BatchEvaluationFailure::new(message, task_id.clone()),
            };
            return Err(failure.into());
        }

        Ok(BatchOutcome { result, outputs })
    }

    async fn evaluate_item(
        &self,
        task_id: &TaskId,
        item: &E::Item,
        semaphore: &Semaphore,
        processed: &AtomicUsize,
        total: usize,
    ) -> (String, std::result::Result<E::Output, EvaluationFailure>) {
        // The semaphore is never closed, so acquire cannot fail here.
        let _permit = semaphore.acquire().await.ok();
        let outcome = self.evaluate_with_retry(task_id, item).await;
        let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker
            .update_progress(task_id, done, total, self.gate.running_status())
            .await;
        (self.evaluator.describe(item), outcome)
    }

    async fn evaluate_with_retry(
        &self,
        task_id: &TaskId,
        item: &E::Item,
    ) -> std::result::Result<E::Output, EvaluationFailure> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.gate.wait_resumed().await;
            match self.evaluator.evaluate(item).await {
                Ok(output) => {
                    METRICS.inc_items_evaluated();
                    if attempt > 1 {
                        let label = self.evaluator.describe(item);
                        self.tracker
                            .add_log(
                                task_id,
                                LogLevel::Info,
                                &format!("{label} succeeded on attempt {attempt}"),
                            )
                            .await;
                    }
                    return Ok(output);
                }
                Err(failure) => {
                    let label = self.evaluator.describe(item);
                    if attempt >= max_attempts {
                        METRICS.inc_items_failed();
                        self.tracker
                            .add_log(
                                task_id,
                                LogLevel::Error,
                                &format!("{label} failed after {attempt} attempts: {failure}"),
                            )
                            .await;
                        return Err(failure);
                    }
                    METRICS.inc_item_retries();
                    obs::emit_item_retry(task_id, &label, attempt, &failure);
                    tokio::time::sleep(self.config.retry.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
