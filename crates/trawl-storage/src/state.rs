//! Shared session state coordination.
//!
//! Several cooperating processes publish their status into one JSON document
//! per session (`<sessions_dir>/<session_id>/state.json`). The orchestrator
//! creates the document; this crate only ever rewrites its `mitm` object and
//! carries every other top-level field through untouched.
//!
//! ## Update protocol
//!
//! ```text
//! read state.json -> merge patch into "mitm" -> write state.json.tmp -> rename
//! ```
//!
//! There is no cross-process locking. Exactly one Trawl instance may manage a
//! given session at a time.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use trawl_core::session::is_valid_session_id;
use trawl_core::ProxyStatus;

use crate::error::{Result, StorageError};

/// File name of the shared state document.
pub const STATE_FILE: &str = "state.json";

/// Sub-directory holding the capture proxy's files.
pub const CAPTURE_DIR: &str = "mitm";

/// Traffic log file name inside [`CAPTURE_DIR`].
pub const TRAFFIC_LOG_FILE: &str = "traffic.jsonl";

/// Capture process output file name inside [`CAPTURE_DIR`].
pub const PROCESS_LOG_FILE: &str = "mitmdump.log";

/// Key of the sub-object owned by this subsystem.
const MITM_KEY: &str = "mitm";

/// Session status as published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    Active,
    Stopping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl OrchestratorStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

/// The `mitm` sub-object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitmState {
    pub status: ProxyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android_proxy_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed view of the shared state document.
///
/// Fields not modelled here are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSessionState {
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "type", default)]
    pub session_type: Option<String>,
    pub status: OrchestratorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitm: Option<MitmState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedSessionState {
    /// Returns true if the orchestrator considers the session live.
    pub fn is_active(&self) -> bool {
        self.status == OrchestratorStatus::Active
    }
}

/// Partial update of the `mitm` sub-object.
///
/// Keys set to `null` are removed from the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MitmPatch {
    fields: Map<String, Value>,
}

impl MitmPatch {
    /// Creates a patch that sets `status`.
    pub fn status(status: ProxyStatus) -> Self {
        let mut patch = Self::default();
        patch.set("status", Value::from(status.as_str()));
        patch
    }

    /// Sets the listening port.
    pub fn port(mut self, port: u16) -> Self {
        self.set("proxyPort", Value::from(port));
        self
    }

    /// Sets the bind address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.set("proxyHost", Value::from(host.into()));
        self
    }

    /// Sets the process id.
    pub fn pid(mut self, pid: u32) -> Self {
        self.set("pid", Value::from(pid));
        self
    }

    /// Removes the process id.
    pub fn clear_pid(mut self) -> Self {
        self.set("pid", Value::Null);
        self
    }

    /// Sets the client connection hint.
    pub fn connection_hint(mut self, hint: impl Into<String>) -> Self {
        self.set("androidProxyConfig", Value::from(hint.into()));
        self
    }

    /// Sets the error message.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.set("error", Value::from(message.into()));
        self
    }

    /// Removes the error message.
    pub fn clear_error(mut self) -> Self {
        self.set("error", Value::Null);
        self
    }

    fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    /// Shallow-merges the patch into `target`.
    pub fn apply(&self, target: &mut Map<String, Value>) {
        for (key, value) in &self.fields {
            if value.is_null() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Reads and merges the per-session shared state document.
#[derive(Debug, Clone)]
pub struct StateCoordinator {
    sessions_dir: PathBuf,
}

impl StateCoordinator {
    /// Creates a coordinator rooted at `sessions_dir`.
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    /// Returns the sessions directory.
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Directory of one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Path of the shared state document.
    pub fn state_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(STATE_FILE)
    }

    /// Directory holding the capture proxy's files.
    pub fn capture_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CAPTURE_DIR)
    }

    /// Path of the traffic log.
    pub fn traffic_log_path(&self, session_id: &str) -> PathBuf {
        self.capture_dir(session_id).join(TRAFFIC_LOG_FILE)
    }

    /// Path of the capture process output log.
    pub fn process_log_path(&self, session_id: &str) -> PathBuf {
        self.capture_dir(session_id).join(PROCESS_LOG_FILE)
    }

    /// Loads the shared state document.
    pub async fn read(&self, session_id: &str) -> Result<SharedSessionState> {
        let document = self.read_document(session_id).await?;
        serde_json::from_value(Value::Object(document)).map_err(|e| StorageError::StateRead {
            session_id: session_id.to_string(),
            message: e.to_string(),
        })
    }

    /// Merges `patch` into the `mitm` object and writes the document back.
    pub async fn update_mitm(
        &self,
        session_id: &str,
        patch: &MitmPatch,
    ) -> Result<SharedSessionState> {
        let mut document = self.read_document(session_id).await?;

        let mitm = document
            .entry(MITM_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !mitm.is_object() {
            *mitm = Value::Object(Map::new());
        }
        if let Value::Object(fields) = mitm {
            patch.apply(fields);
        }

        let write_err = |message: String| StorageError::StateWrite {
            session_id: session_id.to_string(),
            message,
        };

        let document = Value::Object(document);
        let contents = serde_json::to_string_pretty(&document).map_err(|e| write_err(e.to_string()))?;

        let path = self.state_path(session_id);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| write_err(e.to_string()))?;

        debug!(session_id, "Updated mitm state");

        serde_json::from_value(document).map_err(|e| StorageError::StateRead {
            session_id: session_id.to_string(),
            message: e.to_string(),
        })
    }

    /// Creates the session directory if needed.
    pub async fn ensure_session_dir(&self, session_id: &str) -> Result<PathBuf> {
        self.check_id(session_id)?;
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Creates a sub-directory of the session directory if needed.
    pub async fn ensure_sub_dir(&self, session_id: &str, name: &str) -> Result<PathBuf> {
        self.check_id(session_id)?;
        let dir = self.session_dir(session_id).join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn read_document(&self, session_id: &str) -> Result<Map<String, Value>> {
        self.check_id(session_id)?;

        let read_err = |message: String| StorageError::StateRead {
            session_id: session_id.to_string(),
            message,
        };

        let contents = match tokio::fs::read(self.state_path(session_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            }
            Err(e) => return Err(read_err(e.to_string())),
        };

        match serde_json::from_slice::<Value>(&contents) {
            Ok(Value::Object(document)) => Ok(document),
            Ok(_) => Err(read_err("state document is not a JSON object".to_string())),
            Err(e) => Err(read_err(e.to_string())),
        }
    }

    fn check_id(&self, session_id: &str) -> Result<()> {
        if is_valid_session_id(session_id) {
            Ok(())
        } else {
            Err(StorageError::SessionNotFound {
                session_id: session_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use trawl_core::ErrorCode;

    fn orchestrator_doc(status: &str) -> Value {
        json!({
            "sessionId": "s1",
            "type": "android",
            "status": status,
            "createdAt": "2024-05-01T10:00:00.000Z",
            "android": {
                "deviceId": "emulator-5554",
                "ports": [5554, 5555],
                "nested": {"a": 1.5, "b": null}
            },
            "custom": "kept"
        })
    }

    async fn setup(doc: &Value) -> (TempDir, StateCoordinator) {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());
        coordinator.ensure_session_dir("s1").await.unwrap();
        std::fs::write(
            coordinator.state_path("s1"),
            serde_json::to_string_pretty(doc).unwrap(),
        )
        .unwrap();
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_read_missing_document() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());

        let err = coordinator.read("nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.session_id(), Some("nope"));
    }

    #[tokio::test]
    async fn test_read_malformed_document() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());
        coordinator.ensure_session_dir("s1").await.unwrap();
        std::fs::write(coordinator.state_path("s1"), "{not json").unwrap();

        let err = coordinator.read("s1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateReadFailed);
    }

    #[tokio::test]
    async fn test_read_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());

        let err = coordinator.read("../etc").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_read_parses_orchestrator_fields() {
        let (_dir, coordinator) = setup(&orchestrator_doc("active")).await;

        let state = coordinator.read("s1").await.unwrap();
        assert!(state.is_active());
        assert_eq!(state.session_type.as_deref(), Some("android"));
        assert!(state.mitm.is_none());
        assert_eq!(state.extra["custom"], "kept");
    }

    #[tokio::test]
    async fn test_unknown_orchestrator_status() {
        let (_dir, coordinator) = setup(&orchestrator_doc("paused")).await;

        let state = coordinator.read("s1").await.unwrap();
        assert_eq!(state.status, OrchestratorStatus::Unknown);
        assert!(!state.is_active());
    }

    #[tokio::test]
    async fn test_update_creates_mitm_object() {
        let (_dir, coordinator) = setup(&orchestrator_doc("active")).await;

        let patch = MitmPatch::status(ProxyStatus::Starting)
            .port(8080)
            .host("0.0.0.0");
        let state = coordinator.update_mitm("s1", &patch).await.unwrap();

        let mitm = state.mitm.unwrap();
        assert_eq!(mitm.status, ProxyStatus::Starting);
        assert_eq!(mitm.proxy_port, Some(8080));
        assert_eq!(mitm.proxy_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(mitm.pid, None);
    }

    /// Written the way the orchestrator writes it: two-space indent, raw
    /// UTF-8, no trailing newline.
    const ORCHESTRATOR_TEXT: &str = r#"{
  "sessionId": "s1",
  "type": "android",
  "status": "active",
  "createdAt": "2024-05-01T10:00:00.000Z",
  "android": {
    "deviceId": "emulator-5554",
    "ports": [
      5554,
      5555
    ],
    "nested": {
      "a": 1.5,
      "b": null,
      "empty": [],
      "label": "café ✓ a/b"
    }
  },
  "mitm": {
    "status": "ready",
    "proxyPort": 8080,
    "pid": 42
  },
  "custom": "kept"
}"#;

    #[tokio::test]
    async fn test_update_preserves_sibling_fields_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());
        coordinator.ensure_session_dir("s1").await.unwrap();
        std::fs::write(coordinator.state_path("s1"), ORCHESTRATOR_TEXT).unwrap();

        coordinator
            .update_mitm("s1", &MitmPatch::status(ProxyStatus::Error))
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(coordinator.state_path("s1")).unwrap();

        let android_start = ORCHESTRATOR_TEXT.find("  \"android\"").unwrap();
        let mitm_start = ORCHESTRATOR_TEXT.find("  \"mitm\"").unwrap();
        let head = &ORCHESTRATOR_TEXT[..mitm_start];
        let android = &ORCHESTRATOR_TEXT[android_start..mitm_start];
        assert!(on_disk.starts_with(head));
        assert!(on_disk.contains(android));
        assert!(on_disk.ends_with("  \"custom\": \"kept\"\n}"));

        let expected = ORCHESTRATOR_TEXT.replace("\"status\": \"ready\"", "\"status\": \"error\"");
        assert_eq!(on_disk, expected);
    }

    #[tokio::test]
    async fn test_update_clears_pid() {
        let mut doc = orchestrator_doc("active");
        doc["mitm"] = json!({"status": "ready", "proxyPort": 8080, "pid": 42});
        let (_dir, coordinator) = setup(&doc).await;

        let state = coordinator
            .update_mitm("s1", &MitmPatch::status(ProxyStatus::Stopped).clear_pid())
            .await
            .unwrap();

        let mitm = state.mitm.unwrap();
        assert_eq!(mitm.status, ProxyStatus::Stopped);
        assert_eq!(mitm.pid, None);
        assert_eq!(mitm.proxy_port, Some(8080));

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(coordinator.state_path("s1")).unwrap())
                .unwrap();
        assert!(raw["mitm"].get("pid").is_none());
    }

    #[tokio::test]
    async fn test_update_missing_document_fails() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());

        let err = coordinator
            .update_mitm("s1", &MitmPatch::status(ProxyStatus::Ready))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert!(!coordinator.state_path("s1").exists());
    }

    #[tokio::test]
    async fn test_ensure_dirs_idempotent() {
        let dir = TempDir::new().unwrap();
        let coordinator = StateCoordinator::new(dir.path());

        let first = coordinator.ensure_sub_dir("s1", CAPTURE_DIR).await.unwrap();
        let second = coordinator.ensure_sub_dir("s1", CAPTURE_DIR).await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(first, coordinator.capture_dir("s1"));
        assert_eq!(
            coordinator.traffic_log_path("s1"),
            dir.path().join("s1").join("mitm").join("traffic.jsonl")
        );
    }
}
