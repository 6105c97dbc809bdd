use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("Peer {0} is not connected")]
    NotConnected(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error classification carried across the wire in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvariantViolation,
    IdentityMismatch,
    NotLeader,
    Internal,
}

impl GovernorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GovernorError::NotFound(_) => ErrorCode::NotFound,
            GovernorError::InvariantViolation(_) => ErrorCode::InvariantViolation,
            GovernorError::IdentityMismatch(_) => ErrorCode::IdentityMismatch,
            GovernorError::NotLeader(_) => ErrorCode::NotLeader,
            GovernorError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild a local error from an error reply so callers can match on the
    /// same variants regardless of which governor raised it.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotFound => GovernorError::NotFound(message),
            ErrorCode::InvariantViolation => GovernorError::InvariantViolation(message),
            ErrorCode::IdentityMismatch => GovernorError::IdentityMismatch(message),
            ErrorCode::NotLeader => GovernorError::NotLeader(None),
            ErrorCode::Internal => GovernorError::Remote { code, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GovernorError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GovernorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_survives_the_wire() {
        let err = GovernorError::NotFound("job abc".to_string());
        let rebuilt = GovernorError::from_remote(err.code(), err.to_string());
        assert!(rebuilt.is_not_found());
    }

    #[test]
    fn transport_errors_map_to_internal() {
        let err = GovernorError::PeerUnavailable("127.0.0.1:9000".to_string());
        assert_eq!(err.code(), ErrorCode::Internal);

        let rebuilt = GovernorError::from_remote(ErrorCode::Internal, "boom".to_string());
        assert!(matches!(
            rebuilt,
            GovernorError::Remote {
                code: ErrorCode::Internal,
                ..
            }
        ));
    }
}
