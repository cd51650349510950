use thiserror::Error;

use super::WorkflowStatus;
use crate::checkpoint::CheckpointError;
use crate::governance::GovernanceViolation;
use crate::stages::StageKind;

/// Errors surfaced by the engine and session layer.
///
/// Every variant maps to a stable machine-readable [`code`](WorkflowError::code)
/// so clients can tell a rejected request from a failed stage or a storage fault.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    #[error("Governance limit reached: {0}")]
    Governance(#[from] GovernanceViolation),

    #[error("Checkpoint persistence failed: {0}")]
    Persistence(#[from] CheckpointError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No capability registered for stage '{stage}'")]
    UnregisteredStage { stage: StageKind },
}

/// Misuse of the start/resume protocol
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("No checkpoint exists for thread {thread_id}")]
    NotFound { thread_id: String },

    #[error("Thread {thread_id} is {found}, expected {expected}")]
    InvalidState {
        thread_id: String,
        expected: WorkflowStatus,
        found: WorkflowStatus,
    },

    #[error("Thread {thread_id} has already been started")]
    AlreadyStarted { thread_id: String },

    #[error("Unknown session {session_id}")]
    UnknownSession { session_id: String },
}

impl WorkflowError {
    pub fn validation(reason: impl Into<String>) -> Self {
        WorkflowError::Validation {
            reason: reason.into(),
        }
    }

    /// Stable code carried by client-visible error events
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Validation { .. } => "validation_error",
            WorkflowError::Governance(violation) => violation.code(),
            WorkflowError::Persistence(_) => "persistence_error",
            WorkflowError::Protocol(ProtocolError::NotFound { .. })
            | WorkflowError::Protocol(ProtocolError::UnknownSession { .. }) => "not_found",
            WorkflowError::Protocol(ProtocolError::InvalidState { .. })
            | WorkflowError::Protocol(ProtocolError::AlreadyStarted { .. }) => "invalid_state",
            WorkflowError::UnregisteredStage { .. } => "configuration_error",
        }
    }

    /// Rate-limit rejections happen before any session exists
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            WorkflowError::Governance(GovernanceViolation::RateLimited { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_family() {
        let not_found = WorkflowError::from(ProtocolError::NotFound {
            thread_id: "t".into(),
        });
        let invalid = WorkflowError::from(ProtocolError::InvalidState {
            thread_id: "t".into(),
            expected: WorkflowStatus::Paused,
            found: WorkflowStatus::Completed,
        });
        let unregistered = WorkflowError::UnregisteredStage {
            stage: StageKind::Debug,
        };

        assert_eq!(not_found.code(), "not_found");
        assert_eq!(invalid.code(), "invalid_state");
        assert_eq!(unregistered.code(), "configuration_error");
        assert_eq!(WorkflowError::validation("empty").code(), "validation_error");
    }

    #[test]
    fn test_rate_limit_is_flagged() {
        let err = WorkflowError::from(GovernanceViolation::RateLimited {
            client: "10.0.0.1".into(),
            limit: 3,
            window_secs: 3600,
        });
        assert!(err.is_rate_limited());
        assert_eq!(err.code(), "rate_limited");
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn test_invalid_state_message_names_both_statuses() {
        let err = ProtocolError::InvalidState {
            thread_id: "abc".into(),
            expected: WorkflowStatus::Paused,
            found: WorkflowStatus::Running,
        };
        assert_eq!(err.to_string(), "Thread abc is RUNNING, expected PAUSED");
    }
}
