//! Error types for proxy lifecycle management.

use thiserror::Error;
use trawl_core::ErrorCode;
use trawl_storage::StorageError;

use crate::supervisor::ProcessExit;

/// Process supervisor error type.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS could not create the process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process was created but reported no pid.
    #[error("{program} started without a process id")]
    NoPid { program: String },

    /// The process exited during the start grace period.
    #[error("{program} {exit} during startup")]
    ExitedEarly { program: String, exit: ProcessExit },
}

/// Proxy lifecycle error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The orchestrator has not marked the session active.
    #[error("session {session_id} is not active (status: {status})")]
    InvalidState { session_id: String, status: String },

    /// A proxy is already starting or running for the session.
    #[error("proxy already running for session {session_id}")]
    AlreadyRunning { session_id: String },

    /// No proxy is tracked for the session.
    #[error("no proxy running for session {session_id}")]
    NotRunning { session_id: String },

    /// Every port in the configured range is taken.
    #[error("no free port in range {start}-{end} for session {session_id}")]
    PortUnavailable {
        session_id: String,
        start: u16,
        end: u16,
    },

    /// Launching the capture proxy failed.
    #[error("failed to start capture proxy for session {session_id}: {source}")]
    StartFailed {
        session_id: String,
        #[source]
        source: Box<ProxyError>,
    },

    /// Shared state or traffic log error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Process supervision error.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidState { .. } => ErrorCode::SessionInvalidState,
            Self::AlreadyRunning { .. } => ErrorCode::ProxyAlreadyRunning,
            Self::NotRunning { .. } => ErrorCode::ProxyNotRunning,
            Self::PortUnavailable { .. } => ErrorCode::PortUnavailable,
            Self::StartFailed { .. } | Self::Supervisor(_) => ErrorCode::StartFailed,
            Self::Storage(e) => e.code(),
            Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Returns the session the error concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::InvalidState { session_id, .. }
            | Self::AlreadyRunning { session_id }
            | Self::NotRunning { session_id }
            | Self::PortUnavailable { session_id, .. }
            | Self::StartFailed { session_id, .. } => Some(session_id),
            Self::Storage(e) => e.session_id(),
            Self::Supervisor(_) | Self::Io(_) => None,
        }
    }
}

/// Result type for proxy lifecycle operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
