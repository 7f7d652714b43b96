// ── Viking Bridge: Session Link Registry ───────────────────────────────────
//
// Persistent mapping from host session keys to store session metadata,
// backed by the host's session store file: a single JSON object keyed by
// sessionKey. Entries carry the host's own fields (sessionId, updatedAt,
// sessionFile) plus this bridge's fields (openvikingSessionId,
// lastSyncedSeq, lastCommitAt); unknown fields round-trip untouched.
//
// Reads take no lock. Writes are an atomic read-modify-write of the whole
// file (temp + rename) serialized by one async mutex. Once a store session
// id is recorded for a key it never changes.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::client::VikingStore;

type LinkMap = std::collections::BTreeMap<String, SessionLinkEntry>;

/// One session store entry. CamelCase on disk; fields this bridge does not
/// own are preserved through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionLinkEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    /// Store-side session id; immutable once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openviking_session_id: Option<String>,
    /// Monotonic count of events queued (not necessarily delivered).
    pub last_synced_seq: u64,
    /// Wall-clock ms of the last queued commit; zero when none yet.
    pub last_commit_at: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct SessionLinkRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

/// Default host session store location.
pub fn default_session_store_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    home.join(".paw").join("openviking-sessions.json")
}

impl SessionLinkRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Reads (non-blocking) ───────────────────────────────────────────────

    pub async fn get(&self, session_key: &str) -> Option<SessionLinkEntry> {
        match self.load_map().await {
            Ok(map) => map.get(session_key).cloned(),
            Err(e) => {
                warn!("[session-link] read failed, treating as unlinked: {e}");
                None
            }
        }
    }

    /// The linked store session id, if this key has ever been ensured.
    pub async fn linked_session_id(&self, session_key: &str) -> Option<String> {
        self.get(session_key).await.and_then(|e| e.openviking_session_id)
    }

    // ── Ensure-link ────────────────────────────────────────────────────────

    /// Return the store session id for this key, creating one on first use.
    ///
    /// The store call happens outside the file lock; if a concurrent ensure
    /// wins the subsequent read-modify-write, its id is kept and ours is
    /// abandoned (the id is immutable once recorded).
    pub async fn ensure_link<S: VikingStore + ?Sized>(
        &self,
        session_key: &str,
        store: &S,
    ) -> EngineResult<String> {
        if let Some(existing) = self.linked_session_id(session_key).await {
            return Ok(existing);
        }

        let created = store.create_session().await?;
        info!("[session-link] created store session {created} for key {session_key}");

        let entry = self
            .update(session_key, |entry| {
                if entry.openviking_session_id.is_none() {
                    entry.openviking_session_id = Some(created.clone());
                }
            })
            .await?;

        entry
            .openviking_session_id
            .ok_or_else(|| EngineError::Config("session link lost during ensure".into()))
    }

    // ── Write-path bookkeeping ─────────────────────────────────────────────

    /// Increment `lastSyncedSeq` by `max(1, delta)`; returns the new value.
    pub async fn bump_seq(&self, session_key: &str, delta: u64) -> EngineResult<u64> {
        let entry = self
            .update(session_key, |entry| {
                entry.last_synced_seq += delta.max(1);
            })
            .await?;
        Ok(entry.last_synced_seq)
    }

    /// Record that a commit was queued now.
    pub async fn mark_commit_queued(&self, session_key: &str) -> EngineResult<()> {
        self.update(session_key, |entry| {
            entry.last_commit_at = chrono::Utc::now().timestamp_millis();
        })
        .await?;
        Ok(())
    }

    // ── File plumbing ──────────────────────────────────────────────────────

    async fn load_map(&self) -> EngineResult<LinkMap> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LinkMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(LinkMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomic read-modify-write of one entry. Mutations are serialized; a
    /// parse failure propagates rather than clobbering the host's file.
    async fn update<F>(&self, session_key: &str, mutate: F) -> EngineResult<SessionLinkEntry>
    where
        F: FnOnce(&mut SessionLinkEntry),
    {
        let _guard = self.write_lock.lock().await;

        let mut map = self.load_map().await?;
        let entry = map.entry(session_key.to_string()).or_default();
        mutate(entry);
        entry.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let snapshot = entry.clone();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&map)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(snapshot)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{RelationEntry, SearchResponse, SessionEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store fake that mints sequential session ids.
    struct FakeStore {
        created: AtomicUsize,
    }

    impl FakeStore {
        fn new() -> Self {
            Self { created: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl VikingStore for FakeStore {
        async fn create_session(&self) -> EngineResult<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("s-{n}"))
        }
        async fn add_events_batch(&self, _: &str, events: &[SessionEvent]) -> EngineResult<u64> {
            Ok(events.len() as u64)
        }
        async fn commit_session(&self, _: &str, _: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn search(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: usize,
            _: Option<f64>,
        ) -> EngineResult<SearchResponse> {
            Ok(SearchResponse::default())
        }
        async fn find(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: usize,
            _: Option<f64>,
        ) -> EngineResult<SearchResponse> {
            Ok(SearchResponse::default())
        }
        async fn relations(&self, _: &str) -> EngineResult<Vec<RelationEntry>> {
            Ok(vec![])
        }
        async fn read_content(&self, _: &str) -> EngineResult<String> {
            Ok(String::new())
        }
        async fn abstract_of(&self, _: &str) -> EngineResult<String> {
            Ok(String::new())
        }
        async fn overview_of(&self, _: &str) -> EngineResult<String> {
            Ok(String::new())
        }
        async fn observer_health(
            &self,
            component: &str,
        ) -> EngineResult<crate::engine::client::ObserverComponentHealth> {
            Ok(crate::engine::client::ObserverComponentHealth {
                name: component.to_string(),
                is_healthy: true,
                has_errors: false,
            })
        }
    }

    #[tokio::test]
    async fn ensure_link_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionLinkRegistry::new(dir.path().join("sessions.json"));
        let store = FakeStore::new();

        let first = registry.ensure_link("agent:main:discord", &store).await.unwrap();
        let second = registry.ensure_link("agent:main:discord", &store).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.created.load(Ordering::SeqCst), 1);

        // A different key gets its own store session.
        let other = registry.ensure_link("agent:main:slack", &store).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn bump_seq_is_monotonic_with_floor_of_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionLinkRegistry::new(dir.path().join("sessions.json"));

        assert_eq!(registry.bump_seq("k", 3).await.unwrap(), 3);
        assert_eq!(registry.bump_seq("k", 0).await.unwrap(), 4);
        assert_eq!(registry.bump_seq("k", 2).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn mark_commit_queued_sets_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionLinkRegistry::new(dir.path().join("sessions.json"));

        assert_eq!(registry.get("k").await.map(|e| e.last_commit_at), None);
        registry.mark_commit_queued("k").await.unwrap();
        let at = registry.get("k").await.unwrap().last_commit_at;
        assert!(at > 0);
    }

    #[tokio::test]
    async fn host_owned_fields_survive_bridge_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"agent:main":{"sessionId":"host-1","sessionFile":"t.jsonl","customFlag":true}}"#,
        )
        .unwrap();

        let registry = SessionLinkRegistry::new(&path);
        registry.bump_seq("agent:main", 1).await.unwrap();

        let entry = registry.get("agent:main").await.unwrap();
        assert_eq!(entry.session_id.as_deref(), Some("host-1"));
        assert_eq!(entry.session_file.as_deref(), Some("t.jsonl"));
        assert_eq!(entry.extra.get("customFlag"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(entry.last_synced_seq, 1);
    }

    #[tokio::test]
    async fn missing_file_reads_as_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionLinkRegistry::new(dir.path().join("absent.json"));
        assert!(registry.get("anything").await.is_none());
        assert!(registry.linked_session_id("anything").await.is_none());
    }
}
