//! Capture session model.
//!
//! ## States
//!
//! ```text
//! pending -> starting -> ready -> error
//!                |          |        |
//!                +----------+--------+--> stopped
//! ```
//!
//! A session that fails while starting lands in `error`; it only reaches
//! `stopped` through an explicit stop.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a capture proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Session object exists, nothing launched yet.
    #[default]
    Pending,
    /// Port allocated and process being launched.
    Starting,
    /// Process running and accepting traffic.
    Ready,
    /// Stopped by an explicit request.
    Stopped,
    /// Launch failed or the process exited on its own.
    Error,
}

impl ProxyStatus {
    /// Returns true while a start is in flight or the proxy is serving.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }

    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Returns whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ProxyStatus) -> bool {
        use ProxyStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Ready)
                | (Starting, Error)
                | (Ready, Error)
                | (_, Stopped)
        )
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory record of one capture proxy session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySession {
    pub session_id: String,
    pub status: ProxyStatus,
    pub proxy_port: u16,
    pub proxy_host: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub traffic_log_path: PathBuf,
    pub process_log_path: PathBuf,
}

impl ProxySession {
    /// Creates a session in the `pending` state.
    pub fn new(
        session_id: impl Into<String>,
        proxy_port: u16,
        proxy_host: impl Into<String>,
        traffic_log_path: PathBuf,
        process_log_path: PathBuf,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status: ProxyStatus::Pending,
            proxy_port,
            proxy_host: proxy_host.into(),
            pid: None,
            started_at: None,
            stopped_at: None,
            error: None,
            traffic_log_path,
            process_log_path,
        }
    }

    /// Moves the session to `next`, returning false if the transition is illegal.
    pub fn transition(&mut self, next: ProxyStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Marks the session as failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ProxyStatus::Error;
        self.error = Some(message.into());
    }

    /// Client-facing `host:port` hint for this session.
    pub fn connection_hint(&self, client_proxy_host: &str) -> String {
        connection_hint(&self.proxy_host, self.proxy_port, client_proxy_host)
    }
}

/// Builds the `host:port` a client should configure as its proxy.
///
/// A proxy bound to every interface or to loopback is not reachable under
/// that address from a device, so the configured client host is used instead.
pub fn connection_hint(listen_host: &str, port: u16, client_proxy_host: &str) -> String {
    let host = match listen_host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() || ip.is_loopback() => client_proxy_host,
        _ if listen_host.eq_ignore_ascii_case("localhost") => client_proxy_host,
        _ => listen_host,
    };
    format!("{}:{}", host, port)
}

/// Returns true if `id` can be used as a single path component.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}
