//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use trawl_core::{ErrorCode, QueryError};
use trawl_proxy::ProxyError;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Lifecycle or storage failure.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// No captured exchange with this id.
    #[error("entry {entry_id} not found in session {session_id}")]
    EntryNotFound {
        session_id: String,
        entry_id: String,
    },

    /// Malformed filter value.
    #[error("{source}")]
    Query {
        session_id: String,
        #[source]
        source: QueryError,
    },

    /// Malformed request.
    #[error("bad request: {message}")]
    BadRequest { session_id: String, message: String },
}

impl ApiError {
    /// Rejects a filter value on `session_id`'s route.
    pub fn query(session_id: impl Into<String>, source: QueryError) -> Self {
        ApiError::Query {
            session_id: session_id.into(),
            source,
        }
    }

    /// Rejects a malformed request on `session_id`'s route.
    pub fn bad_request(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Proxy(e) => e.code(),
            ApiError::EntryNotFound { .. } => ErrorCode::EntryNotFound,
            ApiError::Query { .. } | ApiError::BadRequest { .. } => ErrorCode::InvalidRequest,
        }
    }

    /// Returns the session the error concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ApiError::Proxy(e) => e.session_id(),
            ApiError::EntryNotFound { session_id, .. }
            | ApiError::Query { session_id, .. }
            | ApiError::BadRequest { session_id, .. } => Some(session_id),
        }
    }
}

/// HTTP status for an error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionNotFound | ErrorCode::ProxyNotRunning | ErrorCode::EntryNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::SessionInvalidState | ErrorCode::ProxyAlreadyRunning => StatusCode::CONFLICT,
        ErrorCode::PortUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::StartFailed
        | ErrorCode::StateReadFailed
        | ErrorCode::StateWriteFailed
        | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = status_for(code);

        if status.is_server_error() {
            error!(code = %code, session_id = ?self.session_id(), error = %self, "Request failed");
        } else {
            debug!(code = %code, session_id = ?self.session_id(), error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code,
            session_id: self.session_id().map(str::to_string),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::SessionNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::EntryNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::ProxyAlreadyRunning), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::SessionInvalidState), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorCode::PortUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorCode::InvalidRequest), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorCode::StartFailed),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body() {
        let err = ApiError::EntryNotFound {
            session_id: "s1".to_string(),
            entry_id: "e9".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "ENTRY_NOT_FOUND");
        assert_eq!(json["sessionId"], "s1");
        assert!(json["error"].as_str().unwrap().contains("e9"));
    }

    #[test]
    fn test_query_error_is_invalid_request() {
        let err = ApiError::query("s1", QueryError::InvalidStatusRange("9xx".to_string()));
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.session_id(), Some("s1"));
        assert!(err.to_string().contains("9xx"));

        let err = ApiError::bad_request("s2", "expected value");
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(err.session_id(), Some("s2"));
    }
}
