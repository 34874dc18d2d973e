//! Storage error types.

use thiserror::Error;
use trawl_core::ErrorCode;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The shared state document does not exist.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The shared state document exists but could not be read or parsed.
    #[error("failed to read state for session {session_id}: {message}")]
    StateRead { session_id: String, message: String },

    /// The shared state document could not be written.
    #[error("failed to write state for session {session_id}: {message}")]
    StateWrite { session_id: String, message: String },

    /// IO error outside the shared state document (traffic log, directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            Self::StateRead { .. } => ErrorCode::StateReadFailed,
            Self::StateWrite { .. } => ErrorCode::StateWriteFailed,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Returns the session the error concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionNotFound { session_id }
            | Self::StateRead { session_id, .. }
            | Self::StateWrite { session_id, .. } => Some(session_id),
            Self::Io(_) => None,
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_session_context() {
        let err = StorageError::SessionNotFound {
            session_id: "s1".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.session_id(), Some("s1"));

        let err = StorageError::StateRead {
            session_id: "s2".to_string(),
            message: "expected value at line 1 column 1".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::StateReadFailed);
        assert!(err.to_string().contains("s2"));

        let err = StorageError::from(std::io::Error::other("disk full"));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.session_id(), None);
    }
}
