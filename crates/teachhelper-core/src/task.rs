//! Task identity and lifecycle.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Rejected task identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTaskId {
    #[error("task id must not be empty or blank")]
    Blank,
}

/// Correlation key of a batch job.
///
/// Always non-blank. The wrapped string is kept verbatim, no trimming or
/// case folding, so the id a failure reports is exactly the id the job was
/// registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Validate and wrap a task identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidTaskId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InvalidTaskId::Blank);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random task id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = InvalidTaskId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TaskId {
    type Error = InvalidTaskId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for TaskId {
    type Err = InvalidTaskId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Status of a tracked task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::CompletedWithErrors
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    /// Whether a task in this status may be reset and run again.
    pub fn is_retryable(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Re-asserting the current non-terminal status is allowed so progress
    /// updates can repeat `Running`. The only step out of a terminal status
    /// is the retry reset of a failed or cancelled task to `Pending`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self.is_terminal() {
            return self.is_retryable() && next == Pending;
        }
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(
                next,
                Paused | Completed | CompletedWithErrors | Failed | Cancelled
            ),
            // A batch whose in-flight items drain while paused still finishes.
            Paused => matches!(
                next,
                Running | Completed | CompletedWithErrors | Failed | Cancelled
            ),
            Completed | CompletedWithErrors | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Paused => write!(f, "PAUSED"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::CompletedWithErrors => write!(f, "COMPLETED_WITH_ERRORS"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_rejects_blank() {
        assert_eq!(TaskId::new(""), Err(InvalidTaskId::Blank));
        assert_eq!(TaskId::new("   "), Err(InvalidTaskId::Blank));
        assert_eq!(TaskId::new("\t\n"), Err(InvalidTaskId::Blank));
    }

    #[test]
    fn test_task_id_kept_verbatim() {
        let id = TaskId::new(" batch-42 ").unwrap();
        assert_eq!(id.as_str(), " batch-42 ");
        assert_eq!(id.to_string(), " batch-42 ");
    }

    #[test]
    fn test_task_id_generate_is_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_task_id_serde_rejects_blank() {
        let id: TaskId = serde_json::from_str("\"batch-7\"").expect("deserialize");
        assert_eq!(id.as_str(), "batch-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"batch-7\"");

        let err = serde_json::from_str::<TaskId>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_task_status_serde_uses_upper_snake_case() {
        let json = serde_json::to_string(&TaskStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"COMPLETED_WITH_ERRORS\"");
        let status: TaskStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        assert_eq!(TaskStatus::Running.to_string(), "RUNNING");
    }

    #[test]
    fn test_terminal_states_do_not_resume() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::CompletedWithErrors,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Paused));
            assert!(!terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_only_failed_or_cancelled_can_be_retried() {
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::CompletedWithErrors.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Failed.is_retryable());
        assert!(!TaskStatus::Completed.is_retryable());
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::CompletedWithErrors));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Pending));
    }
}
