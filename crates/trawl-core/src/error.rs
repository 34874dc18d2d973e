//! Stable error codes shared by every Trawl crate.
//!
//! Each crate owns its own error enum; all of them map onto an [`ErrorCode`]
//! so that callers on the other side of the HTTP boundary can branch on a
//! fixed vocabulary instead of parsing messages.

use serde::{Deserialize, Serialize};

/// Stable, externally visible error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The shared state document for the session does not exist.
    SessionNotFound,
    /// The peer orchestrator has not marked the session active.
    SessionInvalidState,
    /// A capture proxy is already starting or running for the session.
    ProxyAlreadyRunning,
    /// No capture proxy is tracked for the session.
    ProxyNotRunning,
    /// No bindable port was found in the configured range.
    PortUnavailable,
    /// The capture process could not be launched.
    #[serde(rename = "MITMDUMP_START_FAILED")]
    StartFailed,
    /// The shared state document could not be read or parsed.
    StateReadFailed,
    /// The shared state document could not be written.
    StateWriteFailed,
    /// No traffic entry matches the requested id.
    EntryNotFound,
    /// Malformed input at the boundary.
    InvalidRequest,
    /// Anything unexpected.
    InternalError,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionInvalidState => "SESSION_INVALID_STATE",
            Self::ProxyAlreadyRunning => "PROXY_ALREADY_RUNNING",
            Self::ProxyNotRunning => "PROXY_NOT_RUNNING",
            Self::PortUnavailable => "PORT_UNAVAILABLE",
            Self::StartFailed => "MITMDUMP_START_FAILED",
            Self::StateReadFailed => "STATE_READ_FAILED",
            Self::StateWriteFailed => "STATE_WRITE_FAILED",
            Self::EntryNotFound => "ENTRY_NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
