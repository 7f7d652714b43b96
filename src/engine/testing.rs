// ── Viking Bridge: Test Doubles ────────────────────────────────────────────
// Shared in-memory store fake for unit tests. Scriptable per call family;
// records everything it is handed so tests assert on observable traffic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{RelationEntry, SearchResponse, SessionEvent};
use crate::engine::client::{ObserverComponentHealth, VikingStore};

#[derive(Debug, Clone, Default)]
pub struct LayeredContent {
    pub read: Option<String>,
    pub abstract_text: Option<String>,
    pub overview: Option<String>,
}

#[derive(Default)]
pub struct FakeStore {
    pub created: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_batches: AtomicBool,
    pub batches: Mutex<Vec<(String, Vec<SessionEvent>)>>,
    pub commits: Mutex<Vec<(String, String)>>,
    pub search_response: Mutex<SearchResponse>,
    pub find_response: Mutex<SearchResponse>,
    pub search_calls: AtomicUsize,
    pub find_calls: AtomicUsize,
    pub search_limits: Mutex<Vec<usize>>,
    pub find_limits: Mutex<Vec<usize>>,
    pub relations_map: Mutex<HashMap<String, Vec<RelationEntry>>>,
    pub relations_calls: AtomicUsize,
    pub fail_relations_for: Mutex<Vec<String>>,
    pub unhealthy_components: Mutex<Vec<String>>,
    pub contents: Mutex<HashMap<String, LayeredContent>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(self, response: SearchResponse) -> Self {
        *self.search_response.lock() = response;
        self
    }

    pub fn with_find(self, response: SearchResponse) -> Self {
        *self.find_response.lock() = response;
        self
    }

    pub fn set_content(&self, uri: &str, content: LayeredContent) {
        self.contents.lock().insert(uri.to_string(), content);
    }

    pub fn link(&self, uri: &str, neighbors: Vec<RelationEntry>) {
        self.relations_map.lock().insert(uri.to_string(), neighbors);
    }

    pub fn delivered_events(&self) -> usize {
        self.batches.lock().iter().map(|(_, events)| events.len()).sum()
    }

    pub fn queued_commit_causes(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, events)| events.clone())
            .filter_map(|e| match e.body {
                crate::atoms::types::SessionEventBody::Commit { cause } => Some(cause),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl VikingStore for FakeStore {
    async fn create_session(&self) -> EngineResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("store down".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("s-{n}"))
    }

    async fn add_events_batch(
        &self,
        session_id: &str,
        events: &[SessionEvent],
    ) -> EngineResult<u64> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("store down".into()));
        }
        self.batches.lock().push((session_id.to_string(), events.to_vec()));
        Ok(events.len() as u64)
    }

    async fn commit_session(&self, session_id: &str, cause: &str) -> EngineResult<()> {
        self.commits.lock().push((session_id.to_string(), cause.to_string()));
        Ok(())
    }

    async fn search(
        &self,
        _query: &str,
        _target_uri: &str,
        _session_id: Option<&str>,
        limit: usize,
        _score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.search_limits.lock().push(limit);
        Ok(self.search_response.lock().clone())
    }

    async fn find(
        &self,
        _query: &str,
        _target_uri: &str,
        _session_id: Option<&str>,
        limit: usize,
        _score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.find_limits.lock().push(limit);
        Ok(self.find_response.lock().clone())
    }

    async fn relations(&self, uri: &str) -> EngineResult<Vec<RelationEntry>> {
        self.relations_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_relations_for.lock().iter().any(|u| u == uri) {
            return Err(EngineError::Transport("relations unavailable".into()));
        }
        Ok(self.relations_map.lock().get(uri).cloned().unwrap_or_default())
    }

    async fn read_content(&self, uri: &str) -> EngineResult<String> {
        Ok(self
            .contents
            .lock()
            .get(uri)
            .and_then(|c| c.read.clone())
            .unwrap_or_default())
    }

    async fn abstract_of(&self, uri: &str) -> EngineResult<String> {
        Ok(self
            .contents
            .lock()
            .get(uri)
            .and_then(|c| c.abstract_text.clone())
            .unwrap_or_default())
    }

    async fn overview_of(&self, uri: &str) -> EngineResult<String> {
        Ok(self
            .contents
            .lock()
            .get(uri)
            .and_then(|c| c.overview.clone())
            .unwrap_or_default())
    }

    async fn observer_health(&self, component: &str) -> EngineResult<ObserverComponentHealth> {
        if self.unhealthy_components.lock().iter().any(|c| c == component) {
            return Ok(ObserverComponentHealth {
                name: component.to_string(),
                is_healthy: false,
                has_errors: true,
            });
        }
        Ok(ObserverComponentHealth {
            name: component.to_string(),
            is_healthy: true,
            has_errors: false,
        })
    }
}
