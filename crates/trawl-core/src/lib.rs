//! Trawl Core - configuration, error codes, and traffic/session models.
//!
//! This crate has no I/O beyond reading environment variables. It defines:
//!
//! - [`config::TrawlConfig`]: runtime settings with `TRAWL_*` overrides
//! - [`error::ErrorCode`]: the stable error vocabulary shared by every crate
//! - [`session`]: capture proxy lifecycle states and session records
//! - [`traffic`]: the capture log record format and derived stats
//! - [`query`]: traffic filters, status classes, and time parsing

pub mod config;
pub mod error;
pub mod query;
pub mod session;
pub mod traffic;

pub use config::{ConfigError, TrawlConfig, DEFAULT_PROXY_PORT};
pub use error::ErrorCode;
pub use query::{QueryError, StatusRange, TrafficQuery};
pub use session::{ProxySession, ProxyStatus};
pub use traffic::{TrafficRecord, TrafficStats, TrafficSummary};
