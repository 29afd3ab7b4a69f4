//! Evaluation error taxonomy.
//!
//! Two failure kinds flow through the grading pipeline:
//! - [`EvaluationFailure`]: one evaluation could not complete. Treated as
//!   localized to that item.
//! - [`BatchEvaluationFailure`]: a tracked batch job could not complete.
//!   Always carries the [`TaskId`] of the job that raised it so the job
//!   record can be marked failed without parsing the message.
//!
//! Both are wrapped by the closed [`EvaluationError`] sum that every
//! fallible pipeline operation returns. Failures are immutable once built.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::task::{InvalidTaskId, TaskId};

/// Underlying error attached to a failure.
///
/// Held behind an `Arc` so cloned failures share the exact same cause and
/// callers can downcast it to the original type.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Iterator over a failure's cause chain, nearest cause first.
pub struct Chain<'a> {
    next: Option<&'a (dyn StdError + 'static)>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a (dyn StdError + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.source();
        Some(current)
    }
}

fn chain_of(cause: Option<&Cause>) -> Chain<'_> {
    Chain {
        next: cause.map(|c| c.as_ref() as &(dyn StdError + 'static)),
    }
}

/// A single evaluation could not complete.
#[derive(Debug, Clone)]
pub struct EvaluationFailure {
    message: String,
    cause: Option<Cause>,
}

impl EvaluationFailure {
    /// Failure with no cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Failure with an underlying error attached.
    pub fn with_cause<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::with_shared_cause(message, Arc::new(cause))
    }

    /// Failure attached to an already shared cause. The same `Arc` is kept.
    pub fn with_shared_cause(message: impl Into<String>, cause: Cause) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause),
        }
    }

    /// Failure whose message is the cause's display text.
    pub fn from_cause<E>(cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let message = cause.to_string();
        Self::with_cause(message, cause)
    }

    /// Human-readable description of what failed.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error this failure wraps, if any.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Every underlying error, nearest first.
    pub fn chain(&self) -> Chain<'_> {
        chain_of(self.cause.as_ref())
    }

    /// The deepest error in the cause chain.
    pub fn root_cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.chain().last()
    }
}

impl fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for EvaluationFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

/// A batch job could not complete.
#[derive(Debug, Clone)]
pub struct BatchEvaluationFailure {
    message: String,
    task_id: TaskId,
    cause: Option<Cause>,
}

impl BatchEvaluationFailure {
    /// Failure with no cause.
    pub fn new(message: impl Into<String>, task_id: TaskId) -> Self {
        Self {
            message: message.into(),
            task_id,
            cause: None,
        }
    }

    /// Validate a raw task id and build the failure; blank ids are rejected.
    pub fn try_new(
        message: impl Into<String>,
        task_id: impl Into<String>,
    ) -> std::result::Result<Self, InvalidTaskId> {
        Ok(Self::new(message, TaskId::new(task_id)?))
    }

    pub fn with_cause<E>(message: impl Into<String>, task_id: TaskId, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::with_shared_cause(message, task_id, Arc::new(cause))
    }

    pub fn with_shared_cause(message: impl Into<String>, task_id: TaskId, cause: Cause) -> Self {
        Self {
            message: message.into(),
            task_id,
            cause: Some(cause),
        }
    }

    /// Human-readable description of what failed.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Id of the batch job that raised this failure, verbatim.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The error this failure wraps, if any.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Every underlying error, nearest first.
    pub fn chain(&self) -> Chain<'_> {
        chain_of(self.cause.as_ref())
    }

    /// The deepest error in the cause chain.
    pub fn root_cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.chain().last()
    }
}

impl fmt::Display for BatchEvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch task {}: {}", self.task_id, self.message)
    }
}

impl StdError for BatchEvaluationFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

/// How a caller should propagate a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Affects one item; report with message and cause chain.
    Localized,
    /// Affects one tracked job; the job must be marked failed.
    EscalateWithCorrelation(TaskId),
}

/// Errors raised by the evaluation pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationFailure),

    #[error(transparent)]
    Batch(#[from] BatchEvaluationFailure),
}

impl EvaluationError {
    /// Human-readable description of what failed.
    pub fn message(&self) -> &str {
        match self {
            EvaluationError::Evaluation(e) => e.message(),
            EvaluationError::Batch(e) => e.message(),
        }
    }

    /// Correlation key, present only for batch failures.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EvaluationError::Evaluation(_) => None,
            EvaluationError::Batch(e) => Some(e.task_id()),
        }
    }

    /// How the pipeline boundary must handle this error.
    pub fn escalation(&self) -> Escalation {
        match self {
            EvaluationError::Evaluation(_) => Escalation::Localized,
            EvaluationError::Batch(e) => Escalation::EscalateWithCorrelation(e.task_id().clone()),
        }
    }

    /// Every underlying error, nearest first.
    pub fn chain(&self) -> Chain<'_> {
        match self {
            EvaluationError::Evaluation(e) => e.chain(),
            EvaluationError::Batch(e) => e.chain(),
        }
    }
}

/// Result type for evaluation pipeline operations.
pub type Result<T> = std::result::Result<T, EvaluationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("attempt to divide {0} by zero")]
    struct DivideByZero(i64);

    #[derive(Debug, thiserror::Error)]
    #[error("scorer crashed")]
    struct ScorerCrashed(#[source] DivideByZero);

    #[test]
    fn test_evaluation_failure_message_only() {
        let err = EvaluationFailure::new("scoring timed out");
        assert_eq!(err.message(), "scoring timed out");
        assert!(err.cause().is_none());
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "scoring timed out");
    }

    #[test]
    fn test_evaluation_failure_preserves_cause() {
        let err = EvaluationFailure::with_cause("division by zero", DivideByZero(7));
        assert_eq!(err.message(), "division by zero");

        let cause = err.cause().expect("cause");
        assert_eq!(cause.downcast_ref::<DivideByZero>(), Some(&DivideByZero(7)));

        let source = err.source().expect("source");
        assert_eq!(source.downcast_ref::<DivideByZero>(), Some(&DivideByZero(7)));
    }

    #[test]
    fn test_shared_cause_is_the_same_allocation() {
        let cause: Cause = Arc::new(DivideByZero(1));
        let err = EvaluationFailure::with_shared_cause("wrapped", Arc::clone(&cause));
        assert!(Arc::ptr_eq(err.cause().unwrap(), &cause));

        let cloned = err.clone();
        assert!(Arc::ptr_eq(cloned.cause().unwrap(), &cause));
    }

    #[test]
    fn test_from_cause_derives_message() {
        let err = EvaluationFailure::from_cause(DivideByZero(3));
        assert_eq!(err.message(), "attempt to divide 3 by zero");
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_root_cause_walks_chain() {
        let err =
            EvaluationFailure::with_cause("evaluation failed", ScorerCrashed(DivideByZero(9)));
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        assert_eq!(chain, vec!["scorer crashed", "attempt to divide 9 by zero"]);

        let root = err.root_cause().expect("root");
        assert_eq!(root.downcast_ref::<DivideByZero>(), Some(&DivideByZero(9)));
    }

    #[test]
    fn test_batch_failure_keeps_task_id() {
        let err = BatchEvaluationFailure::try_new("partial failure", "batch-42").unwrap();
        assert_eq!(err.task_id().as_str(), "batch-42");
        assert_eq!(err.message(), "partial failure");
        assert!(err.to_string().contains("batch-42"));
        assert!(err.to_string().contains("partial failure"));
    }

    #[test]
    fn test_batch_failure_rejects_blank_task_id() {
        let err = BatchEvaluationFailure::try_new("partial failure", "");
        assert_eq!(err.unwrap_err(), InvalidTaskId::Blank);
    }

    #[test]
    fn test_batch_failure_with_cause() {
        let task_id = TaskId::new("batch-9").unwrap();
        let inner = EvaluationFailure::new("answer 17 could not be scored");
        let err = BatchEvaluationFailure::with_cause("all evaluations failed", task_id, inner);

        let cause = err.cause().expect("cause");
        let inner = cause.downcast_ref::<EvaluationFailure>().expect("evaluation failure");
        assert_eq!(inner.message(), "answer 17 could not be scored");
    }

    #[test]
    fn test_repeated_reads_are_stable() {
        let err = BatchEvaluationFailure::try_new("m", "t-1").unwrap();
        for _ in 0..3 {
            assert_eq!(err.task_id().as_str(), "t-1");
            assert_eq!(err.message(), "m");
        }
    }

    #[test]
    fn test_escalation_classification() {
        let local: EvaluationError = EvaluationFailure::new("bad answer").into();
        assert_eq!(local.escalation(), Escalation::Localized);
        assert!(local.task_id().is_none());

        let batch: EvaluationError = BatchEvaluationFailure::try_new("job died", "batch-1")
            .unwrap()
            .into();
        let expected = TaskId::new("batch-1").unwrap();
        assert_eq!(batch.escalation(), Escalation::EscalateWithCorrelation(expected.clone()));
        assert_eq!(batch.task_id(), Some(&expected));
        assert_eq!(batch.message(), "job died");
    }

    #[test]
    fn test_evaluation_error_is_transparent() {
        let err: EvaluationError =
            EvaluationFailure::with_cause("division by zero", DivideByZero(2)).into();
        assert_eq!(err.to_string(), "division by zero");
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<DivideByZero>().is_some());
        assert_eq!(err.chain().count(), 1);
    }

    #[test]
    fn test_failures_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<EvaluationFailure>();
        assert_send_sync::<BatchEvaluationFailure>();
        assert_send_sync::<EvaluationError>();
    }
}
