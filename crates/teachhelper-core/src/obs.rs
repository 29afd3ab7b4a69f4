//! Structured observability hooks for batch task lifecycle events.
//!
//! This module provides:
//! - Task-scoped tracing spans via [`task_span`]
//! - Emission functions for key lifecycle events: batch start, item retry,
//!   batch finish, failures, and the pause/resume/cancel/retry controls
//!
//! Events are emitted at `info!` level unless noted. Filtering follows
//! `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::error::EvaluationError;
use crate::task::{TaskId, TaskStatus};

/// Span tagging everything a batch job logs with its task id.
///
/// ```ignore
/// runtime_future.instrument(task_span(&task_id)).await;
/// ```
pub fn task_span(task_id: &TaskId) -> tracing::Span {
    tracing::info_span!("teachhelper.task", task_id = %task_id)
}

/// Render a failure and its causes as `message: cause: root`.
pub fn describe_chain(error: &EvaluationError) -> String {
    let mut rendered = error.message().to_string();
    for cause in error.chain() {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
    }
    rendered
}

pub fn emit_batch_started(task_id: &TaskId, total: usize, concurrency: usize) {
    info!(
        event = "batch.started",
        task_id = %task_id,
        total = total,
        concurrency = concurrency,
    );
}

/// Emit event: an item attempt failed and will be retried.
pub fn emit_item_retry(task_id: &TaskId, item: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "batch.item_retry",
        task_id = %task_id,
        item = %item,
        attempt = attempt,
        error = %error,
    );
}

pub fn emit_batch_finished(
    task_id: &TaskId,
    status: TaskStatus,
    succeeded: usize,
    failed: usize,
    duration_ms: u64,
) {
    info!(
        event = "batch.finished",
        task_id = %task_id,
        status = %status,
        succeeded = succeeded,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: a batch failure reached the boundary (warn level).
pub fn emit_batch_failed(task_id: &TaskId, error: &EvaluationError) {
    warn!(
        event = "batch.failed",
        task_id = %task_id,
        error = %describe_chain(error),
    );
}

/// Emit event: an uncorrelated evaluation failure reached the boundary.
///
/// No task id exists for these, so the whole cause chain is logged.
pub fn emit_evaluation_failed(error: &EvaluationError) {
    warn!(event = "evaluation.failed", error = %describe_chain(error));
}

pub fn emit_task_cancelled(task_id: &TaskId) {
    info!(event = "task.cancelled", task_id = %task_id);
}

pub fn emit_task_paused(task_id: &TaskId) {
    info!(event = "task.paused", task_id = %task_id);
}

pub fn emit_task_resumed(task_id: &TaskId) {
    info!(event = "task.resumed", task_id = %task_id);
}

/// Emit event: a failed or cancelled task was queued again.
pub fn emit_task_retried(task_id: &TaskId, previous: TaskStatus) {
    info!(event = "task.retried", task_id = %task_id, previous = %previous);
}
