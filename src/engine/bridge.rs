// ── Viking Bridge: Write Bridge ────────────────────────────────────────────
//
// Translates host events (messages, tool results, lifecycle markers) into
// store events, queues them through the outbox, and fires commit triggers.
//
// Enqueue contract:
//   1. backend disabled or dual-write off → clean "not queued"
//   2. ensure the session link; creation failure → "not queued", nothing
//      touches disk
//   3. outbox enabled → durable enqueue; otherwise a direct batch call
//   4. per-type counters + lastEventQueuedAt
//   5. unless the batch carried a commit (or the caller suppressed
//      triggers): bump lastSyncedSeq, then evaluate commit triggers
//
// Trigger evaluation is non-reentrant: the commit a trigger queues passes
// `skip_commit_triggers` down the same enqueue path, so it can never
// re-trigger itself.

use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use crate::atoms::constants::{MAX_EVENT_CONTENT_BYTES, TRUNCATION_MARKER};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{
    CommitMode, EventRole, ResolvedMemoryConfig, SessionEvent,
};
use crate::engine::client::{VikingClient, VikingStore};
use crate::engine::diagnostics::{BridgeStats, DiagnosticsHub};
use crate::engine::outbox::{Outbox, OutboxStats, StoreSender};
use crate::engine::session_link::SessionLinkRegistry;

// ── Outcome ────────────────────────────────────────────────────────────────

/// What happened to a write. `NotQueued` is a clean no-op, not an error:
/// the host observes stats to notice a silently disabled backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { depth: usize },
    NotQueued { reason: String },
}

impl EnqueueOutcome {
    pub fn queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued { .. })
    }

    fn skipped(reason: impl Into<String>) -> Self {
        EnqueueOutcome::NotQueued { reason: reason.into() }
    }
}

// ── Bridge ─────────────────────────────────────────────────────────────────

pub struct WriteBridge {
    agent_id: String,
    config: ResolvedMemoryConfig,
    store: Arc<dyn VikingStore>,
    links: Arc<SessionLinkRegistry>,
    outbox: Option<Arc<Outbox>>,
    diagnostics: Arc<DiagnosticsHub>,
}

impl WriteBridge {
    pub fn new(
        agent_id: impl Into<String>,
        config: ResolvedMemoryConfig,
        store: Arc<dyn VikingStore>,
        links: Arc<SessionLinkRegistry>,
        outbox: Option<Arc<Outbox>>,
        diagnostics: Arc<DiagnosticsHub>,
    ) -> Self {
        Self { agent_id: agent_id.into(), config, store, links, outbox, diagnostics }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn store(&self) -> Arc<dyn VikingStore> {
        Arc::clone(&self.store)
    }

    pub fn links(&self) -> Arc<SessionLinkRegistry> {
        Arc::clone(&self.links)
    }

    pub fn diagnostics(&self) -> Arc<DiagnosticsHub> {
        Arc::clone(&self.diagnostics)
    }

    pub fn outbox(&self) -> Option<Arc<Outbox>> {
        self.outbox.clone()
    }

    /// Stop the outbox timer; an in-flight flush completes first.
    pub async fn shutdown(&self) {
        if let Some(outbox) = &self.outbox {
            outbox.stop().await;
        }
    }

    // ── Host-facing event capture ──────────────────────────────────────────

    /// Queue one conversation message. Content is trimmed; empty content is
    /// a no-op, oversized content is truncated with a stable marker.
    pub async fn record_message(
        &self,
        session_key: &str,
        role: EventRole,
        content: &str,
    ) -> EngineResult<EnqueueOutcome> {
        let content = match sanitize_content(content) {
            Some(content) => content,
            None => return Ok(EnqueueOutcome::skipped("empty content")),
        };
        self.enqueue_events(session_key, vec![SessionEvent::message(role, content)], false).await
    }

    /// Queue a tool result. `content` is the host's JSON encoding of the
    /// tool call and outcome.
    pub async fn record_tool_result(
        &self,
        session_key: &str,
        content: &str,
    ) -> EngineResult<EnqueueOutcome> {
        let content = match sanitize_content(content) {
            Some(content) => content,
            None => return Ok(EnqueueOutcome::skipped("empty content")),
        };
        self.enqueue_events(session_key, vec![SessionEvent::tool_result(content)], false).await
    }

    // ── Enqueue core ───────────────────────────────────────────────────────

    pub async fn enqueue_events(
        &self,
        session_key: &str,
        events: Vec<SessionEvent>,
        skip_commit_triggers: bool,
    ) -> EngineResult<EnqueueOutcome> {
        if !self.config.enabled || !self.config.dual_write {
            return Ok(EnqueueOutcome::skipped("memory backend disabled"));
        }
        if events.is_empty() {
            return Ok(EnqueueOutcome::skipped("no events"));
        }

        let session_id = match self.links.ensure_link(session_key, &*self.store).await {
            Ok(id) => id,
            Err(e) => {
                warn!("[bridge] session link unavailable for {session_key}: {e}");
                self.with_stats(|s| s.last_error = Some(e.to_string()));
                return Ok(EnqueueOutcome::skipped(format!("session link unavailable: {e}")));
            }
        };

        let has_commit = events.iter().any(SessionEvent::is_commit);
        let event_count = events.len();
        let (messages, tools, commits) = count_by_type(&events);

        let depth = match &self.outbox {
            Some(outbox) => outbox.enqueue(session_key, &session_id, events).await?,
            None => match self.store.add_events_batch(&session_id, &events).await {
                Ok(_) => 0,
                Err(e) => {
                    self.with_stats(|s| s.last_error = Some(e.to_string()));
                    return Err(e);
                }
            },
        };

        self.with_stats(|s| {
            s.events_queued += event_count as u64;
            s.message_events_queued += messages;
            s.tool_events_queued += tools;
            s.commit_events_queued += commits;
            s.last_event_queued_at = Some(now_ms());
        });

        if !has_commit && !skip_commit_triggers {
            let seq = self.links.bump_seq(session_key, event_count as u64).await?;
            self.evaluate_commit_triggers(session_key, seq).await;
        }

        Ok(EnqueueOutcome::Queued { depth })
    }

    // ── Commit triggers ────────────────────────────────────────────────────

    async fn evaluate_commit_triggers(&self, session_key: &str, seq: u64) {
        let every_n = self.config.effective_every_n_messages();
        if every_n > 0 && seq % every_n == 0 {
            self.fire_periodic(session_key, "message-threshold").await;
            return;
        }

        let every_min = self.config.effective_every_n_minutes();
        if every_min > 0 {
            let last_commit_at =
                self.links.get(session_key).await.map(|e| e.last_commit_at).unwrap_or(0);
            if last_commit_at > 0 && now_ms() - last_commit_at >= (every_min as i64) * 60_000 {
                self.fire_periodic(session_key, "time-threshold").await;
            }
        }
    }

    async fn fire_periodic(&self, session_key: &str, source: &str) {
        info!("[bridge] periodic commit ({source}) for {session_key}");
        // Lag is measured against the last content event, read before the
        // commit's own enqueue overwrites the timestamp.
        let last_event_at = self.stats().last_event_queued_at;
        match Box::pin(self.enqueue_events(session_key, vec![SessionEvent::commit("periodic")], true)).await {
            Ok(outcome) if outcome.queued() => {
                let _ = self.links.mark_commit_queued(session_key).await;
                self.with_stats(|s| {
                    if source == "message-threshold" {
                        s.periodic_commits_by_message += 1;
                    } else {
                        s.periodic_commits_by_time += 1;
                    }
                    s.last_periodic_trigger = Some(source.to_string());
                    s.last_periodic_trigger_at = Some(now_ms());
                    record_commit(s, "periodic", source, "async", last_event_at);
                });
            }
            Ok(_) => {}
            Err(e) => warn!("[bridge] periodic commit enqueue failed: {e}"),
        }
    }

    // ── Explicit commits ───────────────────────────────────────────────────

    /// Queue (or, in sync mode, directly issue) a commit for this session.
    /// `session_end` and `reset` causes respect their trigger switches.
    pub async fn enqueue_commit(
        &self,
        session_key: &str,
        cause: &str,
        source: &str,
    ) -> EngineResult<EnqueueOutcome> {
        if !self.config.enabled || !self.config.dual_write {
            return Ok(EnqueueOutcome::skipped("memory backend disabled"));
        }
        if cause == "session_end" && !self.config.commit.triggers.session_end {
            return Ok(EnqueueOutcome::skipped("session_end commits disabled"));
        }
        if cause == "reset" && !self.config.commit.triggers.reset {
            return Ok(EnqueueOutcome::skipped("reset commits disabled"));
        }

        let last_event_at = self.stats().last_event_queued_at;

        if self.config.commit.mode == CommitMode::Sync {
            let session_id = match self.links.ensure_link(session_key, &*self.store).await {
                Ok(id) => id,
                Err(e) => {
                    self.with_stats(|s| s.last_error = Some(e.to_string()));
                    return Ok(EnqueueOutcome::skipped(format!("session link unavailable: {e}")));
                }
            };
            // Sync failures surface the store's message as-is.
            if let Err(e) = self.store.commit_session(&session_id, cause).await {
                self.with_stats(|s| s.last_error = Some(e.to_string()));
                return Err(e);
            }
            self.with_stats(|s| {
                s.commit_events_queued += 1;
                s.sync_commits += 1;
                bump_cause_counter(s, cause, source);
                record_commit(s, cause, source, "sync", last_event_at);
            });
            let _ = self.links.mark_commit_queued(session_key).await;
            return Ok(EnqueueOutcome::Queued { depth: 0 });
        }

        // Async: a single commit event, bypassing trigger re-evaluation and
        // the sequence bump.
        let outcome = self
            .enqueue_events(session_key, vec![SessionEvent::commit(cause)], true)
            .await?;
        if outcome.queued() {
            self.with_stats(|s| {
                s.async_commits += 1;
                bump_cause_counter(s, cause, source);
                record_commit(s, cause, source, "async", last_event_at);
            });
            let _ = self.links.mark_commit_queued(session_key).await;
        }
        Ok(outcome)
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    pub fn stats(&self) -> BridgeStats {
        self.diagnostics.snapshot(&self.agent_id, &self.config.endpoint).bridge
    }

    pub async fn outbox_stats(&self) -> Option<OutboxStats> {
        match &self.outbox {
            Some(outbox) => Some(outbox.get_stats().await),
            None => None,
        }
    }

    fn with_stats<F: FnOnce(&mut BridgeStats)>(&self, mutate: F) {
        self.diagnostics.with_bridge_stats(&self.agent_id, &self.config.endpoint, mutate);
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn count_by_type(events: &[SessionEvent]) -> (u64, u64, u64) {
    let mut counts = (0, 0, 0);
    for event in events {
        match event.body.kind() {
            "message" => counts.0 += 1,
            "tool_result" => counts.1 += 1,
            _ => counts.2 += 1,
        }
    }
    counts
}

fn bump_cause_counter(stats: &mut BridgeStats, cause: &str, source: &str) {
    match cause {
        "periodic" => {
            if source == "time-threshold" {
                stats.periodic_commits_by_time += 1;
            } else {
                stats.periodic_commits_by_message += 1;
            }
        }
        "session_end" => stats.session_end_commits += 1,
        "reset" => stats.reset_commits += 1,
        _ => stats.manual_commits += 1,
    }
}

fn record_commit(
    stats: &mut BridgeStats,
    cause: &str,
    source: &str,
    mode: &str,
    last_event_at: Option<i64>,
) {
    stats.last_commit_cause = Some(cause.to_string());
    stats.last_commit_source = Some(source.to_string());
    stats.last_commit_mode = Some(mode.to_string());
    stats.last_commit_lag_ms = last_event_at.map(|at| now_ms() - at);
}

/// Trim, drop empties, cap with a stable marker.
fn sanitize_content(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= MAX_EVENT_CONTENT_BYTES {
        return Some(trimmed.to_string());
    }
    let capped: String = trimmed.chars().take(MAX_EVENT_CONTENT_BYTES).collect();
    Some(format!("{capped}{TRUNCATION_MARKER}"))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Registry ───────────────────────────────────────────────────────────────
// One durable queue per (agentId, endpoint): bridges are memoised so the
// second ensure returns the same instance. The registry is a plain struct:
// tests build their own; production shares the process-wide one below.

pub struct BridgeRegistry {
    bridges: tokio::sync::Mutex<HashMap<(String, String), Arc<WriteBridge>>>,
    diagnostics: Arc<DiagnosticsHub>,
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self {
            bridges: tokio::sync::Mutex::new(HashMap::new()),
            diagnostics: Arc::new(DiagnosticsHub::new()),
        }
    }

    pub fn diagnostics(&self) -> Arc<DiagnosticsHub> {
        Arc::clone(&self.diagnostics)
    }

    /// Get or build the bridge for (agentId, endpoint). First use builds the
    /// store client and starts the outbox; later calls return the memoised
    /// instance.
    pub async fn ensure(
        &self,
        agent_id: &str,
        config: &ResolvedMemoryConfig,
        links: Arc<SessionLinkRegistry>,
    ) -> EngineResult<Arc<WriteBridge>> {
        let key = (agent_id.to_string(), config.endpoint.trim_end_matches('/').to_string());
        let mut bridges = self.bridges.lock().await;
        if let Some(existing) = bridges.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let store: Arc<dyn VikingStore> = Arc::new(VikingClient::new(config));
        let outbox = if config.outbox.enabled {
            let path = config
                .outbox
                .path
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| default_outbox_path(agent_id, &key.1));
            let sender = Arc::new(StoreSender::new(Arc::clone(&store)));
            let outbox = Arc::new(Outbox::new(path, &config.outbox, sender));
            Arc::clone(&outbox).start().await?;
            Some(outbox)
        } else {
            None
        };

        let bridge = Arc::new(WriteBridge::new(
            agent_id,
            config.clone(),
            store,
            links,
            outbox,
            Arc::clone(&self.diagnostics),
        ));
        bridges.insert(key, Arc::clone(&bridge));
        info!("[bridge] started write bridge for agent {agent_id}");
        Ok(bridge)
    }

    /// Stop every bridge's outbox. Called at process shutdown.
    pub async fn shutdown_all(&self) {
        let bridges: Vec<Arc<WriteBridge>> =
            self.bridges.lock().await.values().cloned().collect();
        for bridge in bridges {
            bridge.shutdown().await;
        }
    }
}

/// Process-wide registry used by host command wiring.
pub static GLOBAL_BRIDGES: LazyLock<BridgeRegistry> = LazyLock::new(BridgeRegistry::new);

fn default_outbox_path(agent_id: &str, endpoint: &str) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    let slug: String = format!("{agent_id}-{endpoint}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    home.join(".paw").join("outbox").join(format!("{slug}.jsonl"))
}

// ── Tests ──────────────────────────────────────────────────────────────────
