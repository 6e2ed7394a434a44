use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the control plane to the request router.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    #[error("{description} exceeded {}ms timeout", .timeout.as_millis())]
    Timeout {
        description: String,
        timeout: Duration,
    },

    #[error("{description} failed: {message}")]
    OperationFailure { description: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{} operation(s) failed", .warnings.len())]
    PartialFailure { warnings: Vec<String> },

    #[error("control state owner has stopped")]
    Unavailable,
}

impl ControlError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ControlError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ControlError::InvalidArgument(msg.into())
    }

    /// Stable tag used in the router envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Timeout { .. } => "timeout",
            ControlError::OperationFailure { .. } => "operation_failure",
            ControlError::NotFound { .. } => "not_found",
            ControlError::InvalidArgument(_) => "invalid_argument",
            ControlError::PartialFailure { .. } => "partial_failure",
            ControlError::Unavailable => "unavailable",
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation() {
        let err = ControlError::Timeout {
            description: "load project".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "load project exceeded 1500ms timeout");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn not_found_formats_kind_and_id() {
        let err = ControlError::not_found("snapshot", "abc");
        assert_eq!(err.to_string(), "snapshot not found: abc");
        assert_eq!(err.kind(), "not_found");
    }
}
