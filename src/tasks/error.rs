use crate::imap::ResponseStatus;
use crate::tasks::TaskId;
use thiserror::Error;

/// Why a task ended in the failed state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The server answered the task's command with `NO`, `BAD` or `BYE`
    #[error("server rejected command ({status}): {text}")]
    CommandRejected { status: ResponseStatus, text: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("prerequisite task {prerequisite} failed: {reason}")]
    DependencyFailed { prerequisite: TaskId, reason: String },

    /// The mailbox the task acts upon was removed from the tree
    #[error("target mailbox no longer exists")]
    TargetInvalidated,

    #[error("task was cancelled")]
    Cancelled,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TaskError {
    pub fn rejected(status: ResponseStatus, text: &str) -> Self {
        TaskError::CommandRejected {
            status,
            text: text.to_string(),
        }
    }

    /// Retrying the same request on a fresh connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskError::ConnectionLost(_) | TaskError::DependencyFailed { .. }
        )
    }

    /// Short machine-friendly name
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::CommandRejected { .. } => "command_rejected",
            TaskError::ConnectionLost(_) => "connection_lost",
            TaskError::DependencyFailed { .. } => "dependency_failed",
            TaskError::TargetInvalidated => "target_invalidated",
            TaskError::Cancelled => "cancelled",
            TaskError::Protocol(_) => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_server_text() {
        let error = TaskError::rejected(ResponseStatus::No, "mailbox removed");
        assert_eq!(
            error.to_string(),
            "server rejected command (NO): mailbox removed"
        );
        assert_eq!(error.kind(), "command_rejected");
        assert!(!error.is_transient());
    }

    #[test]
    fn test_dependency_failure_names_prerequisite() {
        let error = TaskError::DependencyFailed {
            prerequisite: TaskId(3),
            reason: "connection lost: eof".to_string(),
        };
        assert!(error.to_string().contains("#3"));
        assert!(error.is_transient());
    }
}
