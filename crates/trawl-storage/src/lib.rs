//! Trawl Storage - file-backed persistence for capture sessions.
//!
//! This crate owns the two files a capture session reads and writes:
//!
//! - The shared session state document (`state.json`), written jointly with
//!   the session orchestrator. Only its `mitm` object is modified here.
//! - The traffic log (`mitm/traffic.jsonl`), appended by the capture agent
//!   and read incrementally.
//!
//! # Example
//!
//! ```no_run
//! use trawl_core::{ProxyStatus, TrafficQuery};
//! use trawl_storage::{MitmPatch, StateCoordinator, TrafficLogStore};
//!
//! # async fn run() -> trawl_storage::Result<()> {
//! let coordinator = StateCoordinator::new("/var/lib/trawl/sessions");
//! coordinator
//!     .update_mitm("session-1", &MitmPatch::status(ProxyStatus::Starting))
//!     .await?;
//!
//! let store = TrafficLogStore::new(coordinator.traffic_log_path("session-1"));
//! store.initialize().await?;
//! let page = store.query(&TrafficQuery::new()).await?;
//! println!("{} matching exchanges", page.total_matches);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod state;
pub mod traffic_log;

pub use error::{Result, StorageError};
pub use state::{MitmPatch, MitmState, OrchestratorStatus, SharedSessionState, StateCoordinator};
pub use traffic_log::{ClearOutcome, QueryPage, TrafficLogStore};
