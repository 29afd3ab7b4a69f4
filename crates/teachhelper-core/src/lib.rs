//! TeachHelper Core Library
//!
//! Error taxonomy, batch execution and task tracking for the grading
//! service's evaluation pipeline.

pub mod batch;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod runtime;
pub mod service;
pub mod task;
pub mod telemetry;
pub mod tracker;

pub use batch::{
    BatchConfig, BatchEvaluationResult, BatchEvaluator, BatchOutcome, Evaluator, PauseGate,
    RetryPolicy,
};
pub use error::{
    BatchEvaluationFailure, Cause, Chain, Escalation, EvaluationError, EvaluationFailure, Result,
};
pub use metrics::METRICS;
pub use notify::{TaskUpdate, TaskUpdateBroadcaster, BATCH_EVALUATION};
pub use obs::{
    describe_chain, emit_batch_failed, emit_batch_finished, emit_batch_started,
    emit_evaluation_failed, emit_item_retry, emit_task_cancelled, emit_task_paused,
    emit_task_resumed, emit_task_retried, task_span,
};
pub use runtime::TaskRuntimeManager;
pub use service::EvaluationService;
pub use task::{InvalidTaskId, TaskId, TaskStatus};
pub use telemetry::init_tracing;
pub use tracker::{
    report_failure, CompositeTracker, InMemoryTaskTracker, LogLevel, TaskLogEntry, TaskRecord,
    TaskTracker,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
