//! Runtime configuration.
//!
//! Every setting has a documented default and can be overridden through a
//! `TRAWL_*` environment variable. Builder methods cover programmatic
//! overrides (CLI flags, tests).

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;

/// Default lower bound of the proxy port range.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default upper bound of the proxy port range.
pub const DEFAULT_PORT_RANGE_END: u16 = 8180;

/// Default bind address for the capture proxy.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Host an Android emulator uses to reach the host machine's loopback.
pub const DEFAULT_CLIENT_PROXY_HOST: &str = "10.0.2.2";

/// Default capture-agent executable.
pub const DEFAULT_CAPTURE_BIN: &str = "mitmdump";

/// Bodies above this size are streamed by the capture agent instead of buffered.
pub const DEFAULT_STREAM_LARGE_BODIES: &str = "1m";

/// Grace period used to catch a capture process that dies right after spawn.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a terminated capture process gets before it is force-killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The port range is empty.
    #[error("invalid port range: {start}..={end}")]
    InvalidPortRange { start: u16, end: u16 },

    /// A required path is empty.
    #[error("{0} must not be empty")]
    EmptyPath(&'static str),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Trawl runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrawlConfig {
    /// Base data directory (logs, addon script).
    pub data_dir: PathBuf,
    /// Directory holding one sub-directory per session.
    pub sessions_dir: PathBuf,
    /// Capture-agent executable.
    pub capture_bin: PathBuf,
    /// Capture-agent script passed with `-s`.
    pub capture_script: PathBuf,
    /// Inclusive range scanned for a free proxy port.
    pub port_range: RangeInclusive<u16>,
    /// Default bind address when the caller does not supply one.
    pub listen_host: String,
    /// Host advertised to clients when the proxy listens on all interfaces.
    pub client_proxy_host: String,
    /// Streaming threshold handed to the capture agent.
    pub stream_large_bodies: String,
    /// Spawn grace period.
    pub start_timeout: Duration,
    /// TERM to KILL escalation timeout.
    pub stop_timeout: Duration,
}

impl Default for TrawlConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl TrawlConfig {
    /// Creates a configuration rooted at `data_dir` with all other defaults.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            sessions_dir: data_dir.join("sessions"),
            capture_script: data_dir.join("addon").join("har_capture.py"),
            data_dir,
            capture_bin: PathBuf::from(DEFAULT_CAPTURE_BIN),
            port_range: DEFAULT_PROXY_PORT..=DEFAULT_PORT_RANGE_END,
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            client_proxy_host: DEFAULT_CLIENT_PROXY_HOST.to_string(),
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES.to_string(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    ///
    /// Paths derived from the data directory (`sessions_dir`, `capture_script`)
    /// follow an overridden `TRAWL_DATA_DIR` unless they are overridden too.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("TRAWL_DATA_DIR") {
            Some(dir) if !dir.is_empty() => Self::with_data_dir(dir),
            _ => Self::default(),
        };

        if let Some(dir) = non_empty(lookup("TRAWL_SESSIONS_DIR")) {
            config.sessions_dir = PathBuf::from(dir);
        }
        if let Some(bin) = non_empty(lookup("TRAWL_CAPTURE_BIN")) {
            config.capture_bin = PathBuf::from(bin);
        }
        if let Some(script) = non_empty(lookup("TRAWL_CAPTURE_SCRIPT")) {
            config.capture_script = PathBuf::from(script);
        }
        if let Some(host) = non_empty(lookup("TRAWL_LISTEN_HOST")) {
            config.listen_host = host;
        }
        if let Some(host) = non_empty(lookup("TRAWL_CLIENT_PROXY_HOST")) {
            config.client_proxy_host = host;
        }
        if let Some(threshold) = non_empty(lookup("TRAWL_STREAM_LARGE_BODIES")) {
            config.stream_large_bodies = threshold;
        }

        let start = parse_var::<u16>(&lookup, "TRAWL_PORT_RANGE_START")
            .unwrap_or(*config.port_range.start());
        let end =
            parse_var::<u16>(&lookup, "TRAWL_PORT_RANGE_END").unwrap_or(*config.port_range.end());
        config.port_range = start..=end;

        if let Some(ms) = parse_var::<u64>(&lookup, "TRAWL_START_TIMEOUT_MS") {
            config.start_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TRAWL_STOP_TIMEOUT_MS") {
            config.stop_timeout = Duration::from_millis(ms);
        }

        config
    }

    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.port_range.is_empty() {
            return Err(ConfigError::InvalidPortRange {
                start: *self.port_range.start(),
                end: *self.port_range.end(),
            });
        }
        if self.sessions_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("sessions_dir"));
        }
        if self.capture_bin.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("capture_bin"));
        }
        Ok(())
    }

    /// Sets the sessions directory.
    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = dir.into();
        self
    }

    /// Sets the capture-agent executable and script.
    pub fn with_capture(mut self, bin: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        self.capture_bin = bin.into();
        self.capture_script = script.into();
        self
    }

    /// Sets the port range.
    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    /// Sets the default listen host.
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Sets the spawn grace period and the kill escalation timeout.
    pub fn with_timeouts(mut self, start: Duration, stop: Duration) -> Self {
        self.start_timeout = start;
        self.stop_timeout = stop;
        self
    }

    /// Directory for rolling log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Returns the sessions directory.
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "trawl", "trawl")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".trawl"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = non_empty(lookup(key))?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TrawlConfig::with_data_dir("/var/lib/trawl");
        assert_eq!(config.sessions_dir, PathBuf::from("/var/lib/trawl/sessions"));
        assert_eq!(
            config.capture_script,
            PathBuf::from("/var/lib/trawl/addon/har_capture.py")
        );
        assert_eq!(config.capture_bin, PathBuf::from("mitmdump"));
        assert_eq!(config.port_range, 8080..=8180);
        assert_eq!(config.start_timeout, Duration::from_millis(100));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = TrawlConfig::from_lookup(lookup_from(&[
            ("TRAWL_DATA_DIR", "/data"),
            ("TRAWL_CAPTURE_BIN", "/opt/mitmdump"),
            ("TRAWL_PORT_RANGE_START", "9000"),
            ("TRAWL_PORT_RANGE_END", "9010"),
            ("TRAWL_STOP_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.sessions_dir, PathBuf::from("/data/sessions"));
        assert_eq!(config.capture_bin, PathBuf::from("/opt/mitmdump"));
        assert_eq!(config.port_range, 9000..=9010);
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_sessions_dir_override_wins() {
        let config = TrawlConfig::from_lookup(lookup_from(&[
            ("TRAWL_DATA_DIR", "/data"),
            ("TRAWL_SESSIONS_DIR", "/shared/sessions"),
        ]));
        assert_eq!(config.sessions_dir, PathBuf::from("/shared/sessions"));
    }

    #[test]
    fn test_unparseable_override_keeps_default() {
        let config = TrawlConfig::from_lookup(lookup_from(&[
            ("TRAWL_DATA_DIR", "/data"),
            ("TRAWL_PORT_RANGE_START", "eighty"),
            ("TRAWL_START_TIMEOUT_MS", ""),
        ]));
        assert_eq!(*config.port_range.start(), DEFAULT_PROXY_PORT);
        assert_eq!(config.start_timeout, DEFAULT_START_TIMEOUT);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config = TrawlConfig::with_data_dir("/data").with_port_range(9000..=8000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange {
                start: 9000,
                end: 8000
            })
        ));
    }
}
