//! Capture proxy lifecycle manager.
//!
//! The manager owns the in-memory map from session id to the running capture
//! proxy and its traffic log. Each session has its own async mutex; every
//! operation on a session, including exit reconciliation, holds it, so
//! operations on one session never interleave while different sessions
//! proceed independently.
//!
//! ## Start sequence
//!
//! ```text
//! check not running -> read shared state (must be active) -> pick port
//!   -> create dirs -> publish "starting" -> open traffic log
//!   -> spawn capture agent -> publish "ready"
//! ```
//!
//! A failure after the shared state check leaves the session in `error`,
//! publishes the message, and is reported to the caller.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use trawl_core::{
    ProxySession, ProxyStatus, TrafficQuery, TrafficRecord, TrafficStats, TrawlConfig,
};
use trawl_storage::state::CAPTURE_DIR;
use trawl_storage::{ClearOutcome, MitmPatch, QueryPage, StateCoordinator, TrafficLogStore};

use crate::error::{ProxyError, Result};
use crate::port;
use crate::supervisor::{
    ExitHandler, OutputHandler, OutputStream, ProcessExit, ProcessHandle, ProcessSupervisor,
    SpawnSpec,
};

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    pub session_id: String,
    pub proxy_port: u16,
    pub proxy_host: String,
    pub connection_hint: String,
}

/// Result of a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub entries_captured: usize,
}

/// Snapshot of a tracked session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub status: ProxyStatus,
    pub proxy_port: u16,
    pub proxy_host: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub connection_hint: String,
    pub stats: TrafficStats,
}

struct ManagedSession {
    session: ProxySession,
    store: Option<TrafficLogStore>,
    process: Option<ProcessHandle>,
}

impl ManagedSession {
    fn new(session: ProxySession) -> Self {
        Self {
            session,
            store: None,
            process: None,
        }
    }

    fn store(&self) -> Result<&TrafficLogStore> {
        self.store.as_ref().ok_or_else(|| ProxyError::NotRunning {
            session_id: self.session.session_id.clone(),
        })
    }
}

type SessionSlot = Arc<AsyncMutex<Option<ManagedSession>>>;
type SlotGuard = OwnedMutexGuard<Option<ManagedSession>>;
type SessionGuard = OwnedMappedMutexGuard<Option<ManagedSession>, ManagedSession>;

struct ManagerInner {
    config: TrawlConfig,
    coordinator: StateCoordinator,
    supervisor: ProcessSupervisor,
    sessions: parking_lot::Mutex<HashMap<String, SessionSlot>>,
}

/// Starts, stops and inspects capture proxies, one per session.
#[derive(Clone)]
pub struct ProxyManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("sessions_dir", &self.inner.config.sessions_dir)
            .field("tracked", &self.inner.sessions.lock().len())
            .finish()
    }
}

impl ProxyManager {
    /// Creates a manager for `config`.
    pub fn new(config: TrawlConfig) -> Self {
        let coordinator = StateCoordinator::new(&config.sessions_dir);
        let supervisor = ProcessSupervisor::from_config(&config);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                coordinator,
                supervisor,
                sessions: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TrawlConfig {
        &self.inner.config
    }

    /// Returns the shared state coordinator.
    pub fn coordinator(&self) -> &StateCoordinator {
        &self.inner.coordinator
    }

    /// Returns the process supervisor.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    /// Locks the session's slot, creating it if needed.
    ///
    /// A slot released while this call waited on it is no longer in the map;
    /// the lookup is retried so the caller always holds the live slot.
    async fn claim_slot(&self, session_id: &str) -> (SessionSlot, SlotGuard) {
        loop {
            let slot = Arc::clone(
                self.inner
                    .sessions
                    .lock()
                    .entry(session_id.to_string())
                    .or_default(),
            );
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(session_id, &slot) {
                return (slot, guard);
            }
        }
    }

    fn is_current(&self, session_id: &str, slot: &SessionSlot) -> bool {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drops an empty slot from the map. Must be called with the slot locked.
    fn release_slot(&self, session_id: &str, slot: &SessionSlot) {
        let mut sessions = self.inner.sessions.lock();
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(session_id);
        }
    }

    fn existing_slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.inner.sessions.lock().get(session_id).cloned()
    }

    /// Launches a capture proxy for `session_id`.
    ///
    /// `port` and `listen_host` override the allocator and the configured
    /// listen host.
    pub async fn start(
        &self,
        session_id: &str,
        port: Option<u16>,
        listen_host: Option<String>,
    ) -> Result<StartResult> {
        let (slot, mut entry) = self.claim_slot(session_id).await;

        if let Some(existing) = entry.as_ref() {
            if existing.session.status.is_active() {
                return Err(ProxyError::AlreadyRunning {
                    session_id: session_id.to_string(),
                });
            }
        }

        if let Err(e) = self.check_shared_state(session_id).await {
            if entry.is_none() {
                self.release_slot(session_id, &slot);
            }
            return Err(e);
        }

        if let Some(previous) = entry.take() {
            if let Some(store) = previous.store {
                store.close().await;
            }
        }

        let coordinator = &self.inner.coordinator;
        let host = listen_host.unwrap_or_else(|| self.inner.config.listen_host.clone());
        let mut managed = ManagedSession::new(ProxySession::new(
            session_id,
            port.unwrap_or_default(),
            host,
            coordinator.traffic_log_path(session_id),
            coordinator.process_log_path(session_id),
        ));

        match self.launch(&mut managed, port).await {
            Ok(()) => {
                let session = &managed.session;
                let result = StartResult {
                    session_id: session.session_id.clone(),
                    proxy_port: session.proxy_port,
                    proxy_host: session.proxy_host.clone(),
                    connection_hint: session.connection_hint(&self.inner.config.client_proxy_host),
                };
                info!(
                    session_id,
                    port = result.proxy_port,
                    pid = ?session.pid,
                    "Capture proxy ready"
                );
                *entry = Some(managed);
                Ok(result)
            }
            Err(cause) => {
                let message = cause.to_string();
                error!(session_id, error = %message, "Failed to start capture proxy");

                if let Some(process) = managed.process.take() {
                    self.inner.supervisor.kill(&process).await;
                }
                managed.session.fail(message.clone());
                managed.session.pid = None;

                let patch = MitmPatch::status(ProxyStatus::Error)
                    .error(message)
                    .clear_pid();
                if let Err(e) = coordinator.update_mitm(session_id, &patch).await {
                    warn!(session_id, error = %e, "Failed to publish start failure");
                }
                *entry = Some(managed);

                if matches!(cause, ProxyError::PortUnavailable { .. }) {
                    return Err(cause);
                }
                Err(ProxyError::StartFailed {
                    session_id: session_id.to_string(),
                    source: Box::new(cause),
                })
            }
        }
    }

    async fn check_shared_state(&self, session_id: &str) -> Result<()> {
        let shared = self.inner.coordinator.read(session_id).await?;
        if !shared.is_active() {
            return Err(ProxyError::InvalidState {
                session_id: session_id.to_string(),
                status: shared.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn launch(&self, managed: &mut ManagedSession, port: Option<u16>) -> Result<()> {
        let config = &self.inner.config;
        let coordinator = &self.inner.coordinator;
        let session_id = managed.session.session_id.clone();

        let port = match port {
            Some(port) => port,
            None => port::find_free(config.port_range.clone()).ok_or_else(|| {
                ProxyError::PortUnavailable {
                    session_id: session_id.clone(),
                    start: *config.port_range.start(),
                    end: *config.port_range.end(),
                }
            })?,
        };
        managed.session.proxy_port = port;

        coordinator.ensure_session_dir(&session_id).await?;
        coordinator.ensure_sub_dir(&session_id, CAPTURE_DIR).await?;

        managed.session.transition(ProxyStatus::Starting);
        let starting = MitmPatch::status(ProxyStatus::Starting)
            .port(port)
            .host(managed.session.proxy_host.clone())
            .clear_pid()
            .clear_error();
        coordinator.update_mitm(&session_id, &starting).await?;

        let store = TrafficLogStore::new(&managed.session.traffic_log_path);
        store.initialize().await?;
        managed.store = Some(store);

        let spec = self.capture_spec(&managed.session);
        debug!(session_id = %session_id, args = ?spec.args, "Spawning capture agent");
        let output = process_output_sink(&managed.session.process_log_path).await?;
        let handle = self
            .inner
            .supervisor
            .spawn(&spec, output, self.exit_handler(session_id.clone()))
            .await?;

        managed.session.pid = Some(handle.pid());
        managed.session.started_at = Some(Utc::now());
        managed.session.transition(ProxyStatus::Ready);
        managed.process = Some(handle.clone());

        let ready = MitmPatch::status(ProxyStatus::Ready)
            .port(port)
            .host(managed.session.proxy_host.clone())
            .pid(handle.pid())
            .connection_hint(managed.session.connection_hint(&config.client_proxy_host))
            .clear_error();
        coordinator.update_mitm(&session_id, &ready).await?;

        Ok(())
    }

    fn capture_spec(&self, session: &ProxySession) -> SpawnSpec {
        let config = &self.inner.config;
        SpawnSpec::new(&config.capture_bin)
            .arg("-s")
            .arg(&config.capture_script)
            .arg("--set")
            .arg(format!("har_file={}", session.traffic_log_path.display()))
            .arg("--listen-host")
            .arg(&session.proxy_host)
            .arg("--listen-port")
            .arg(session.proxy_port.to_string())
            .arg("--ssl-insecure")
            .arg("--set")
            .arg(format!("stream_large_bodies={}", config.stream_large_bodies))
            .env("PYTHONUNBUFFERED", "1")
    }

    fn exit_handler(&self, session_id: String) -> ExitHandler {
        let manager = self.clone();
        Box::new(move |exit| {
            tokio::spawn(async move {
                manager.reconcile_exit(&session_id, exit).await;
            });
        })
    }

    async fn reconcile_exit(&self, session_id: &str, exit: ProcessExit) {
        let Some(slot) = self.existing_slot(session_id) else {
            return;
        };
        let mut entry = slot.lock().await;
        let Some(managed) = entry.as_mut() else {
            return;
        };
        if managed.session.status != ProxyStatus::Ready || managed.session.pid != Some(exit.pid) {
            debug!(session_id, pid = exit.pid, "Ignoring exit of superseded process");
            return;
        }

        let message = format!("capture proxy {}", exit);
        warn!(
            session_id,
            pid = exit.pid,
            code = ?exit.code,
            signal = ?exit.signal,
            "Capture proxy exited unexpectedly"
        );
        managed.session.fail(message.clone());
        managed.session.pid = None;
        managed.process = None;

        let patch = MitmPatch::status(ProxyStatus::Error)
            .error(message)
            .clear_pid();
        if let Err(e) = self.inner.coordinator.update_mitm(session_id, &patch).await {
            warn!(session_id, error = %e, "Failed to publish proxy exit");
        }
    }

    /// Stops the capture proxy and forgets the session.
    ///
    /// With `keep_data` false the session's capture directory is removed.
    pub async fn stop(&self, session_id: &str, keep_data: bool) -> Result<StopResult> {
        let not_running = || ProxyError::NotRunning {
            session_id: session_id.to_string(),
        };
        let slot = self.existing_slot(session_id).ok_or_else(not_running)?;
        let mut entry = slot.lock().await;
        let taken = entry.take();
        self.release_slot(session_id, &slot);
        let mut managed = taken.ok_or_else(not_running)?;

        if let Some(process) = managed.process.take() {
            if self.inner.supervisor.is_running(process.pid()) {
                let exit = self.inner.supervisor.kill(&process).await;
                debug!(session_id, pid = process.pid(), %exit, "Capture proxy terminated");
            }
        }

        let entries_captured = match managed.store.take() {
            Some(store) => {
                let count = store.count().await.unwrap_or_else(|e| {
                    warn!(session_id, error = %e, "Failed to count captured entries");
                    0
                });
                store.close().await;
                count
            }
            None => 0,
        };

        managed.session.transition(ProxyStatus::Stopped);
        managed.session.stopped_at = Some(Utc::now());
        managed.session.pid = None;

        if !keep_data {
            let dir = self.inner.coordinator.capture_dir(session_id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(session_id, dir = %dir.display(), "Removed capture data"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(session_id, error = %e, "Failed to remove capture data"),
            }
        }

        let patch = MitmPatch::status(ProxyStatus::Stopped).clear_pid();
        if let Err(e) = self.inner.coordinator.update_mitm(session_id, &patch).await {
            warn!(session_id, error = %e, "Failed to publish stop");
        }

        info!(session_id, entries_captured, keep_data, "Capture proxy stopped");
        Ok(StopResult { entries_captured })
    }

    /// Returns the session snapshot with live traffic stats.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus> {
        let managed = self.lock_session(session_id).await?;
        let stats = match managed.store.as_ref() {
            Some(store) => store.stats().await?,
            None => TrafficStats::default(),
        };
        let session = &managed.session;
        Ok(SessionStatus {
            session_id: session.session_id.clone(),
            status: session.status,
            proxy_port: session.proxy_port,
            proxy_host: session.proxy_host.clone(),
            pid: session.pid,
            started_at: session.started_at,
            error: session.error.clone(),
            connection_hint: session.connection_hint(&self.inner.config.client_proxy_host),
            stats,
        })
    }

    /// Runs a traffic query against the session's log.
    pub async fn query(&self, session_id: &str, query: &TrafficQuery) -> Result<QueryPage> {
        let managed = self.lock_session(session_id).await?;
        Ok(managed.store()?.query(query).await?)
    }

    /// Looks up one captured exchange. `None` if the id is unknown.
    pub async fn get_entry(
        &self,
        session_id: &str,
        entry_id: &str,
    ) -> Result<Option<TrafficRecord>> {
        let managed = self.lock_session(session_id).await?;
        Ok(managed.store()?.get_by_id(entry_id).await?)
    }

    /// Removes captured exchanges older than `before_ms`, or all of them.
    pub async fn clear(&self, session_id: &str, before_ms: Option<i64>) -> Result<ClearOutcome> {
        let managed = self.lock_session(session_id).await?;
        let outcome = managed.store()?.clear(before_ms).await?;
        info!(
            session_id,
            removed = outcome.removed,
            remaining = outcome.remaining,
            "Cleared captured traffic"
        );
        Ok(outcome)
    }

    async fn lock_session(&self, session_id: &str) -> Result<SessionGuard> {
        let not_running = || ProxyError::NotRunning {
            session_id: session_id.to_string(),
        };
        let slot = self.existing_slot(session_id).ok_or_else(not_running)?;
        OwnedMutexGuard::try_map(slot.lock_owned().await, Option::as_mut)
            .map_err(|_| not_running())
    }

    /// Ids of sessions currently tracked.
    pub async fn session_ids(&self) -> Vec<String> {
        let slots: Vec<(String, SessionSlot)> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut ids = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Stops every session, then kills any process still tracked.
    ///
    /// Failures are logged and do not prevent the remaining sessions from
    /// being stopped.
    pub async fn cleanup(&self) {
        let ids = self.session_ids().await;
        info!(count = ids.len(), "Stopping all capture sessions");

        for session_id in ids {
            match self.stop(&session_id, true).await {
                Ok(_) | Err(ProxyError::NotRunning { .. }) => {}
                Err(e) => error!(session_id = %session_id, error = %e, "Failed to stop session"),
            }
        }

        self.inner.supervisor.kill_all().await;
    }
}

async fn process_output_sink(path: &Path) -> std::io::Result<OutputHandler> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Ends once the supervisor drops the handler and the queue drains.
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = file.write_all(&chunk).await {
                debug!(error = %e, "Failed to write capture agent output");
            }
        }
        let _ = file.flush().await;
    });

    Ok(Arc::new(move |_stream: OutputStream, chunk: &[u8]| {
        let _ = tx.send(chunk.to_vec());
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tempfile::TempDir;
    use trawl_core::ErrorCode;

    /// Fake capture agent: appends one record to the `har_file` it is given,
    /// prints a line, then idles.
    const WELL_BEHAVED: &str = r#"
for arg in "$@"; do
  case "$arg" in
    har_file=*) log="${arg#har_file=}" ;;
  esac
done
printf '%s\n' '{"id":"entry-1","timestampMs":1000,"request":{"method":"GET","url":"https://api.example.com/a","bodySize":3},"response":{"status":200,"contentType":"text/plain","bodySize":5,"body":"hello"}}' >> "$log"
echo "proxy listening"
exec sleep 30
"#;

    struct Fixture {
        dir: TempDir,
        manager: ProxyManager,
    }

    impl Fixture {
        fn new(agent_body: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let bin = dir.path().join("fake-mitmdump");
            std::fs::write(&bin, format!("#!/bin/sh\n{}\n", agent_body)).unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

            let config = TrawlConfig::with_data_dir(dir.path())
                .with_capture(&bin, dir.path().join("har_capture.py"))
                .with_listen_host("0.0.0.0")
                .with_timeouts(Duration::from_millis(200), Duration::from_secs(1));
            let manager = ProxyManager::new(config);
            Self { dir, manager }
        }

        fn sessions_dir(&self) -> PathBuf {
            self.dir.path().join("sessions")
        }

        fn create_session(&self, id: &str, status: &str) {
            let session_dir = self.sessions_dir().join(id);
            std::fs::create_dir_all(&session_dir).unwrap();
            let doc = json!({
                "sessionId": id,
                "type": "android",
                "status": status,
                "createdAt": "2024-05-01T10:00:00.000Z",
                "android": {"deviceId": "emulator-5554"}
            });
            std::fs::write(
                session_dir.join("state.json"),
                serde_json::to_string_pretty(&doc).unwrap(),
            )
            .unwrap();
        }

        fn shared_state(&self, id: &str) -> Value {
            let text =
                std::fs::read_to_string(self.sessions_dir().join(id).join("state.json")).unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    async fn wait_for_status(manager: &ProxyManager, id: &str, status: ProxyStatus) -> SessionStatus {
        for _ in 0..100 {
            let current = manager.status(id).await.unwrap();
            if current.status == status {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        panic!("session {id} never reached {status}");
    }

    async fn wait_for_entries(manager: &ProxyManager, id: &str, count: usize) {
        for _ in 0..100 {
            if manager.status(id).await.unwrap().stats.count >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        panic!("session {id} never captured {count} entries");
    }

    /// Output reaches the process log through a writer task, so poll for it.
    async fn read_until_contains(path: &Path, needle: &str) -> String {
        let mut text = String::new();
        for _ in 0..100 {
            text = std::fs::read_to_string(path).unwrap_or_default();
            if text.contains(needle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        text
    }

    #[tokio::test]
    async fn test_start_then_status_is_ready() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        let started = fx.manager.start("s1", None, None).await.unwrap();
        assert_eq!(started.session_id, "s1");
        assert_eq!(started.proxy_host, "0.0.0.0");
        assert_eq!(
            started.connection_hint,
            format!("10.0.2.2:{}", started.proxy_port)
        );

        let status = fx.manager.status("s1").await.unwrap();
        assert_eq!(status.status, ProxyStatus::Ready);
        assert_eq!(status.proxy_port, started.proxy_port);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());

        let shared = fx.shared_state("s1");
        assert_eq!(shared["mitm"]["status"], "ready");
        assert_eq!(shared["mitm"]["proxyPort"], started.proxy_port);
        assert_eq!(shared["mitm"]["pid"], status.pid.unwrap());
        assert_eq!(shared["mitm"]["androidProxyConfig"], started.connection_hint);
        assert_eq!(shared["android"]["deviceId"], "emulator-5554");

        fx.manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_explicit_port_and_host() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        let started = fx
            .manager
            .start("s1", Some(18_555), Some("192.168.1.20".to_string()))
            .await
            .unwrap();
        assert_eq!(started.proxy_port, 18_555);
        assert_eq!(started.connection_hint, "192.168.1.20:18555");

        fx.manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        fx.manager.start("s1", None, None).await.unwrap();
        let err = fx.manager.start("s1", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyAlreadyRunning);
        assert_eq!(fx.manager.supervisor().tracked_pids().len(), 1);

        fx.manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_start_requires_shared_state() {
        let fx = Fixture::new(WELL_BEHAVED);

        let err = fx.manager.start("ghost", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.session_id(), Some("ghost"));
    }

    #[tokio::test]
    async fn test_start_requires_active_session() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "stopping");

        let err = fx.manager.start("s1", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionInvalidState);
        assert!(fx.shared_state("s1").get("mitm").is_none());
    }

    #[tokio::test]
    async fn test_start_failure_is_published() {
        let fx = Fixture::new("echo 'bad flag' >&2\nexit 2");
        fx.create_session("s1", "active");

        let err = fx.manager.start("s1", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StartFailed);
        assert!(err.to_string().contains("exited with code 2"));

        let status = fx.manager.status("s1").await.unwrap();
        assert_eq!(status.status, ProxyStatus::Error);
        assert!(status.pid.is_none());

        let shared = fx.shared_state("s1");
        assert_eq!(shared["mitm"]["status"], "error");
        assert!(shared["mitm"]["error"]
            .as_str()
            .unwrap()
            .contains("exited with code 2"));

        // An errored session can be started again.
        let err = fx.manager.start("s1", None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StartFailed);
    }

    #[tokio::test]
    async fn test_process_exit_marks_session_error() {
        let fx = Fixture::new("sleep 0.6\nexit 4");
        fx.create_session("s1", "active");

        fx.manager.start("s1", None, None).await.unwrap();
        let status = wait_for_status(&fx.manager, "s1", ProxyStatus::Error).await;
        assert!(status.error.unwrap().contains("code 4"));
        assert!(status.pid.is_none());

        let mut shared = fx.shared_state("s1");
        for _ in 0..50 {
            if shared["mitm"]["status"] == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            shared = fx.shared_state("s1");
        }
        assert_eq!(shared["mitm"]["status"], "error");
        assert!(shared["mitm"].get("pid").is_none());

        let stopped = fx.manager.stop("s1", true).await.unwrap();
        assert_eq!(stopped.entries_captured, 0);
    }

    #[tokio::test]
    async fn test_stop_publishes_and_forgets_session() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        fx.manager.start("s1", None, None).await.unwrap();
        let pid = fx.manager.status("s1").await.unwrap().pid.unwrap();
        wait_for_entries(&fx.manager, "s1", 1).await;

        let stopped = fx.manager.stop("s1", true).await.unwrap();
        assert_eq!(stopped.entries_captured, 1);
        assert!(!fx.manager.supervisor().is_running(pid));

        let err = fx.manager.status("s1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyNotRunning);

        let shared = fx.shared_state("s1");
        assert_eq!(shared["mitm"]["status"], "stopped");
        assert!(shared["mitm"].get("pid").is_none());
        assert_eq!(shared["status"], "active");

        let log = fx.sessions_dir().join("s1").join("mitm");
        assert!(log.join("traffic.jsonl").exists());
        let output = read_until_contains(&log.join("mitmdump.log"), "proxy listening").await;
        assert!(output.contains("proxy listening"));
        assert!(fx.manager.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_keeping_data() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        fx.manager.start("s1", None, None).await.unwrap();
        fx.manager.stop("s1", false).await.unwrap();

        assert!(!fx.sessions_dir().join("s1").join("mitm").exists());
        assert!(fx.sessions_dir().join("s1").join("state.json").exists());
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let fx = Fixture::new(WELL_BEHAVED);

        let err = fx.manager.stop("nope", true).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyNotRunning);
    }

    #[tokio::test]
    async fn test_query_entry_and_clear() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");

        fx.manager.start("s1", None, None).await.unwrap();
        wait_for_entries(&fx.manager, "s1", 1).await;

        let page = fx.manager.query("s1", &TrafficQuery::new()).await.unwrap();
        assert_eq!(page.total_matches, 1);
        assert_eq!(page.entries[0].id, "entry-1");

        let record = fx.manager.get_entry("s1", "entry-1").await.unwrap().unwrap();
        assert_eq!(record.response.body.as_deref(), Some("hello"));
        assert!(fx.manager.get_entry("s1", "entry-2").await.unwrap().is_none());

        let outcome = fx.manager.clear("s1", Some(1_000)).await.unwrap();
        assert_eq!(outcome, ClearOutcome { removed: 0, remaining: 1 });
        let outcome = fx.manager.clear("s1", None).await.unwrap();
        assert_eq!(outcome, ClearOutcome { removed: 1, remaining: 0 });

        let err = fx.manager.query("other", &TrafficQuery::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyNotRunning);

        fx.manager.cleanup().await;
    }

    fn tracked_slots(manager: &ProxyManager) -> usize {
        manager.inner.sessions.lock().len()
    }

    #[tokio::test]
    async fn test_agent_output_lands_in_process_log() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("s1", "active");
        fx.manager.start("s1", None, None).await.unwrap();

        let log_path = fx.sessions_dir().join("s1").join(CAPTURE_DIR).join("mitmdump.log");
        let text = read_until_contains(&log_path, "proxy listening").await;
        assert!(text.contains("proxy listening"), "process log was {text:?}");

        fx.manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_sink_writes_chunks_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let sink = process_output_sink(&path).await.unwrap();
        for i in 0..50 {
            sink(OutputStream::Stdout, format!("line {i}\n").as_bytes());
        }
        sink(OutputStream::Stderr, b"done\n");
        drop(sink);

        let text = read_until_contains(&path, "done\n").await;
        let expected: String = std::iter::once("earlier\n".to_string())
            .chain((0..50).map(|i| format!("line {i}\n")))
            .chain(std::iter::once("done\n".to_string()))
            .collect();
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn test_released_sessions_leave_no_slot() {
        let fx = Fixture::new(WELL_BEHAVED);

        for i in 0..20 {
            let err = fx
                .manager
                .start(&format!("ghost-{i}"), None, None)
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::SessionNotFound);
        }
        fx.create_session("idle", "stopping");
        fx.manager.start("idle", None, None).await.unwrap_err();
        assert_eq!(tracked_slots(&fx.manager), 0);

        fx.create_session("s1", "active");
        fx.manager.start("s1", None, None).await.unwrap();
        assert_eq!(tracked_slots(&fx.manager), 1);

        fx.manager.stop("s1", true).await.unwrap();
        assert_eq!(tracked_slots(&fx.manager), 0);

        fx.manager.stop("s1", true).await.unwrap_err();
        assert_eq!(tracked_slots(&fx.manager), 0);

        // A restart after stop gets a fresh slot.
        fx.manager.start("s1", None, None).await.unwrap();
        assert_eq!(fx.manager.session_ids().await, vec!["s1"]);
        fx.manager.cleanup().await;
        assert_eq!(tracked_slots(&fx.manager), 0);
    }

    #[tokio::test]
    async fn test_cleanup_stops_everything() {
        let fx = Fixture::new(WELL_BEHAVED);
        fx.create_session("a", "active");
        fx.create_session("b", "active");

        fx.manager.start("a", None, None).await.unwrap();
        fx.manager.start("b", None, None).await.unwrap();
        assert_eq!(fx.manager.session_ids().await, vec!["a", "b"]);

        fx.manager.cleanup().await;

        assert!(fx.manager.session_ids().await.is_empty());
        assert!(fx.manager.supervisor().tracked_pids().is_empty());
        assert_eq!(fx.shared_state("a")["mitm"]["status"], "stopped");
        assert_eq!(fx.shared_state("b")["mitm"]["status"], "stopped");
    }
}
