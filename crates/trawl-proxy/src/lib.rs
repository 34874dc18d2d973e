//! Trawl Proxy - capture proxy lifecycle management.
//!
//! This crate runs one external capture agent (`mitmdump` with the HAR
//! capture addon) per session and keeps the session's shared state in step
//! with it.
//!
//! ## Architecture
//!
//! ```text
//! ProxyManager ─┬─ port::find_free        pick a listening port
//!               ├─ StateCoordinator       publish mitm status
//!               ├─ TrafficLogStore        read what the agent captured
//!               └─ ProcessSupervisor      spawn / watch / kill the agent
//!                        │
//!                        └─ exit ──> reconcile session to `error`
//! ```

mod error;
pub mod manager;
pub mod port;
pub mod supervisor;

pub use error::{ProxyError, Result, SupervisorError, SupervisorResult};
pub use manager::{ProxyManager, SessionStatus, StartResult, StopResult};
pub use supervisor::{ProcessExit, ProcessHandle, ProcessSupervisor, SpawnSpec};
