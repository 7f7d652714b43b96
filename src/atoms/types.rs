// ── Paw Atoms: Pure Data Types ─────────────────────────────────────────────
// Plain struct/enum definitions for the OpenViking bridge.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// Wire shapes follow the store's JSON contract (snake_case fields, flat
// event records tagged by `event_type`); host-owned persisted files
// (session store, outbox) use camelCase to stay byte-compatible with what
// the host already writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::atoms::constants::*;

// ═══════════════════════════════════════════════════════════════════════════
// Session events (write path)
// ═══════════════════════════════════════════════════════════════════════════

/// Role attached to `message` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    User,
    Assistant,
}

impl EventRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventRole::User => "user",
            EventRole::Assistant => "assistant",
        }
    }

    /// Parse a host-supplied role string. Anything outside user/assistant is
    /// refused; the store only accepts these two.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(EventRole::User),
            "assistant" => Some(EventRole::Assistant),
            _ => None,
        }
    }
}

/// The event sum type. `message` carries role+content, `tool_result` carries
/// a JSON-encoded tool call description, `commit` carries its cause.
/// Serialized flat with an `event_type` tag, matching the store's batch API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionEventBody {
    Message { role: EventRole, content: String },
    ToolResult { content: String },
    Commit { cause: String },
}

impl SessionEventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEventBody::Message { .. } => "message",
            SessionEventBody::ToolResult { .. } => "tool_result",
            SessionEventBody::Commit { .. } => "commit",
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, SessionEventBody::Commit { .. })
    }
}

/// One event as shipped to `POST /sessions/{id}/events/batch`.
///
/// `event_id` is a fresh UUID per translated event: the store de-duplicates
/// batches on it, so at-least-once outbox redelivery is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub body: SessionEventBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl SessionEvent {
    pub fn message(role: EventRole, content: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            body: SessionEventBody::Message { role, content: content.into() },
            metadata: None,
        }
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            body: SessionEventBody::ToolResult { content: content.into() },
            metadata: None,
        }
    }

    pub fn commit(cause: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            body: SessionEventBody::Commit { cause: cause.into() },
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_commit(&self) -> bool {
        self.body.is_commit()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Resolved memory config
// ═══════════════════════════════════════════════════════════════════════════
// The host validates and deserializes its config file; this crate receives
// the resolved struct. Zero or negative numeric values mean "use the
// documented default"; the `effective_*` accessors implement that rule so
// callers never read raw fields for tunables.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    Sync,
    #[default]
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommitTriggers {
    pub session_end: bool,
    pub reset: bool,
    pub every_n_messages: i64,
    pub every_n_minutes: i64,
}

impl Default for CommitTriggers {
    fn default() -> Self {
        Self {
            session_end: true,
            reset: true,
            every_n_messages: DEFAULT_COMMIT_EVERY_N_MESSAGES,
            every_n_minutes: DEFAULT_COMMIT_EVERY_N_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommitConfig {
    pub mode: CommitMode,
    pub triggers: CommitTriggers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboxConfig {
    pub enabled: bool,
    /// Outbox file path; when absent the bridge derives one per agent.
    pub path: Option<String>,
    pub flush_interval_ms: i64,
    pub max_batch_size: i64,
    pub retry_base_ms: i64,
    pub retry_max_ms: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            flush_interval_ms: DEFAULT_OUTBOX_FLUSH_INTERVAL_MS,
            max_batch_size: DEFAULT_OUTBOX_MAX_BATCH_SIZE,
            retry_base_ms: DEFAULT_OUTBOX_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_OUTBOX_RETRY_MAX_MS,
        }
    }
}

impl OutboxConfig {
    pub fn effective_flush_interval_ms(&self) -> u64 {
        positive_or(self.flush_interval_ms, DEFAULT_OUTBOX_FLUSH_INTERVAL_MS)
    }
    pub fn effective_max_batch_size(&self) -> usize {
        positive_or(self.max_batch_size, DEFAULT_OUTBOX_MAX_BATCH_SIZE) as usize
    }
    pub fn effective_retry_base_ms(&self) -> u64 {
        positive_or(self.retry_base_ms, DEFAULT_OUTBOX_RETRY_BASE_MS)
    }
    pub fn effective_retry_max_ms(&self) -> u64 {
        positive_or(self.retry_max_ms, DEFAULT_OUTBOX_RETRY_MAX_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    #[default]
    Auto,
    MemoryFirst,
    ResourceFirst,
    SkillFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadLayer {
    L0,
    L1,
    L2,
    #[default]
    Progressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchConfig {
    pub limit: i64,
    pub score_threshold: Option<f64>,
    pub target_uri: String,
    pub include_resources: bool,
    pub include_skills: bool,
    pub strategy: SearchStrategy,
    pub read_layer: ReadLayer,
    pub max_entries: i64,
    pub max_snippet_chars: i64,
    pub max_injected_chars: i64,
    pub relation_expansion: bool,
    pub relation_max_depth: i64,
    pub relation_max_anchors: i64,
    pub relation_max_expanded_entries: i64,
    pub relation_seed_anchor_score: f64,
    pub relation_priority_budget_boost: bool,
    pub relation_priority_depth_bonus: i64,
    pub relation_priority_anchors_bonus: i64,
    pub relation_priority_expanded_bonus: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            score_threshold: None,
            target_uri: DEFAULT_TARGET_URI.to_string(),
            include_resources: true,
            include_skills: true,
            strategy: SearchStrategy::Auto,
            read_layer: ReadLayer::Progressive,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_snippet_chars: DEFAULT_MAX_SNIPPET_CHARS,
            max_injected_chars: DEFAULT_MAX_INJECTED_CHARS,
            relation_expansion: false,
            relation_max_depth: DEFAULT_RELATION_MAX_DEPTH,
            relation_max_anchors: DEFAULT_RELATION_MAX_ANCHORS,
            relation_max_expanded_entries: DEFAULT_RELATION_MAX_EXPANDED_ENTRIES,
            relation_seed_anchor_score: DEFAULT_RELATION_SEED_ANCHOR_SCORE,
            relation_priority_budget_boost: false,
            relation_priority_depth_bonus: DEFAULT_RELATION_PRIORITY_DEPTH_BONUS,
            relation_priority_anchors_bonus: DEFAULT_RELATION_PRIORITY_ANCHORS_BONUS,
            relation_priority_expanded_bonus: DEFAULT_RELATION_PRIORITY_EXPANDED_BONUS,
        }
    }
}

impl SearchConfig {
    pub fn effective_limit(&self) -> usize {
        positive_or(self.limit, DEFAULT_SEARCH_LIMIT) as usize
    }
    pub fn effective_target_uri(&self) -> &str {
        if self.target_uri.trim().is_empty() { DEFAULT_TARGET_URI } else { &self.target_uri }
    }
    pub fn effective_max_entries(&self) -> usize {
        positive_or(self.max_entries, DEFAULT_MAX_ENTRIES) as usize
    }
    pub fn effective_max_snippet_chars(&self) -> usize {
        positive_or(self.max_snippet_chars, DEFAULT_MAX_SNIPPET_CHARS) as usize
    }
    pub fn effective_max_injected_chars(&self) -> usize {
        positive_or(self.max_injected_chars, DEFAULT_MAX_INJECTED_CHARS) as usize
    }
    pub fn effective_relation_max_depth(&self) -> usize {
        positive_or(self.relation_max_depth, DEFAULT_RELATION_MAX_DEPTH) as usize
    }
    pub fn effective_relation_max_anchors(&self) -> usize {
        positive_or(self.relation_max_anchors, DEFAULT_RELATION_MAX_ANCHORS) as usize
    }
    pub fn effective_relation_max_expanded_entries(&self) -> usize {
        positive_or(self.relation_max_expanded_entries, DEFAULT_RELATION_MAX_EXPANDED_ENTRIES)
            as usize
    }
    pub fn effective_relation_seed_anchor_score(&self) -> f64 {
        if self.relation_seed_anchor_score > 0.0 {
            self.relation_seed_anchor_score
        } else {
            DEFAULT_RELATION_SEED_ANCHOR_SCORE
        }
    }
    pub fn effective_relation_priority_depth_bonus(&self) -> usize {
        non_negative_or(self.relation_priority_depth_bonus, DEFAULT_RELATION_PRIORITY_DEPTH_BONUS)
            as usize
    }
    pub fn effective_relation_priority_anchors_bonus(&self) -> usize {
        non_negative_or(
            self.relation_priority_anchors_bonus,
            DEFAULT_RELATION_PRIORITY_ANCHORS_BONUS,
        ) as usize
    }
    pub fn effective_relation_priority_expanded_bonus(&self) -> usize {
        non_negative_or(
            self.relation_priority_expanded_bonus,
            DEFAULT_RELATION_PRIORITY_EXPANDED_BONUS,
        ) as usize
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FsWriteConfig {
    pub enabled: bool,
    pub allow_uri_prefixes: Vec<String>,
    pub deny_uri_prefixes: Vec<String>,
    pub protected_uris: Vec<String>,
    pub allow_recursive_rm: bool,
}

/// Fully resolved memory-bridge configuration handed in by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolvedMemoryConfig {
    /// Master switch: when false every write is a clean no-op and reads
    /// return empty results.
    pub enabled: bool,
    /// Mirror events into the store alongside the host's own transcript.
    pub dual_write: bool,
    pub endpoint: String,
    pub timeout_ms: i64,
    pub headers: HashMap<String, String>,
    pub api_key: Option<String>,
    pub commit: CommitConfig,
    pub outbox: OutboxConfig,
    pub search: SearchConfig,
    pub fs_write: FsWriteConfig,
}

impl Default for ResolvedMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dual_write: true,
            endpoint: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            headers: HashMap::new(),
            api_key: None,
            commit: CommitConfig::default(),
            outbox: OutboxConfig::default(),
            search: SearchConfig::default(),
            fs_write: FsWriteConfig::default(),
        }
    }
}

impl ResolvedMemoryConfig {
    pub fn effective_timeout_ms(&self) -> u64 {
        positive_or(self.timeout_ms, DEFAULT_TIMEOUT_MS)
    }

    pub fn effective_every_n_messages(&self) -> u64 {
        non_negative_or(self.commit.triggers.every_n_messages, DEFAULT_COMMIT_EVERY_N_MESSAGES)
    }

    pub fn effective_every_n_minutes(&self) -> u64 {
        non_negative_or(self.commit.triggers.every_n_minutes, DEFAULT_COMMIT_EVERY_N_MINUTES)
    }
}

fn positive_or(value: i64, default: i64) -> u64 {
    if value > 0 { value as u64 } else { default as u64 }
}

fn non_negative_or(value: i64, default: i64) -> u64 {
    if value >= 0 { value as u64 } else { default as u64 }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store wire types (read path)
// ═══════════════════════════════════════════════════════════════════════════

/// One context record as the store returns it from search/find.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextHit {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_reason: Option<String>,
}

/// One typed query from the store's query planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypedQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_directories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub queries: Vec<TypedQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Per-query result signal the store emits alongside the hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResultSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_contexts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Response of `POST /api/v1/search/{search,find}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub memories: Vec<ContextHit>,
    #[serde(default)]
    pub resources: Vec<ContextHit>,
    #[serde(default)]
    pub skills: Vec<ContextHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_plan: Option<QueryPlan>,
    #[serde(default)]
    pub query_results: Vec<QueryResultSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

/// One neighbor edge from `GET /api/v1/relations`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationEntry {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Ranking candidates (transient, per search)
// ═══════════════════════════════════════════════════════════════════════════

/// Which bucket a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Memory,
    Resource,
    Skill,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Memory => "memory",
            ContextKind::Resource => "resource",
            ContextKind::Skill => "skill",
        }
    }

    /// Kind inferred from a store uri path. Session transcripts and memory
    /// directories rank as memories; everything unrecognized is a resource.
    pub fn infer_from_uri(uri: &str) -> Self {
        if uri.contains("/skills/") {
            ContextKind::Skill
        } else if uri.contains("/session/") || uri.contains("/memories/") {
            ContextKind::Memory
        } else {
            ContextKind::Resource
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOrigin {
    Direct,
    Relation,
}

/// A scored candidate flowing through the ranking pipeline.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub kind: ContextKind,
    pub context: ContextHit,
    pub score: f64,
    pub rank: f64,
    pub origin: CandidateOrigin,
    pub relation_from: Option<String>,
    pub relation_depth: usize,
    pub relation_reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Planner decision
// ═══════════════════════════════════════════════════════════════════════════

/// Output of the retrieval planner: which bucket leads, and which extra
/// buckets get consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerDecision {
    pub strategy: SearchStrategy,
    pub reason: String,
    pub priority: ContextKind,
    pub include_resources: bool,
    pub include_skills: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat_with_type_tag() {
        let ev = SessionEvent::message(EventRole::User, "hello");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "message");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json["event_id"].as_str().unwrap().len() > 10);
    }

    #[test]
    fn commit_event_round_trips() {
        let ev = SessionEvent::commit("session_end");
        let json = serde_json::to_string(&ev).unwrap();
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, SessionEventBody::Commit { cause: "session_end".into() });
        assert!(back.is_commit());
    }

    #[test]
    fn role_parse_refuses_unknown() {
        assert_eq!(EventRole::parse("User"), Some(EventRole::User));
        assert_eq!(EventRole::parse(" assistant "), Some(EventRole::Assistant));
        assert_eq!(EventRole::parse("system"), None);
        assert_eq!(EventRole::parse(""), None);
    }

    #[test]
    fn zero_and_negative_config_values_fall_back() {
        let mut cfg = ResolvedMemoryConfig::default();
        cfg.timeout_ms = 0;
        cfg.search.limit = -3;
        cfg.search.max_entries = 0;
        cfg.outbox.flush_interval_ms = -1;
        assert_eq!(cfg.effective_timeout_ms(), DEFAULT_TIMEOUT_MS as u64);
        assert_eq!(cfg.search.effective_limit(), DEFAULT_SEARCH_LIMIT as usize);
        assert_eq!(cfg.search.effective_max_entries(), DEFAULT_MAX_ENTRIES as usize);
        assert_eq!(
            cfg.outbox.effective_flush_interval_ms(),
            DEFAULT_OUTBOX_FLUSH_INTERVAL_MS as u64
        );
    }

    #[test]
    fn every_n_zero_means_disabled_not_default() {
        let mut cfg = ResolvedMemoryConfig::default();
        cfg.commit.triggers.every_n_messages = 0;
        cfg.commit.triggers.every_n_minutes = 0;
        assert_eq!(cfg.effective_every_n_messages(), 0);
        assert_eq!(cfg.effective_every_n_minutes(), 0);
    }

    #[test]
    fn kind_inference_from_uri() {
        assert_eq!(ContextKind::infer_from_uri("viking://skills/howto"), ContextKind::Skill);
        assert_eq!(ContextKind::infer_from_uri("viking://session/s-1"), ContextKind::Memory);
        assert_eq!(
            ContextKind::infer_from_uri("viking://user/memories/pref"),
            ContextKind::Memory
        );
        assert_eq!(ContextKind::infer_from_uri("viking://resource/docs"), ContextKind::Resource);
    }

    #[test]
    fn context_hit_reads_abstract_field() {
        let raw = r#"{"uri":"viking://resource/a","abstract":"短摘要","score":0.5}"#;
        let hit: ContextHit = serde_json::from_str(raw).unwrap();
        assert_eq!(hit.abstract_text.as_deref(), Some("短摘要"));
        assert_eq!(hit.score, Some(0.5));
    }
}
