// ── Viking Bridge: Diagnostics ─────────────────────────────────────────────
//
// Per-(agentId, endpoint) snapshots of what the bridge and the read pipeline
// last did. Single-writer per key, last-writer-wins; the host polls these to
// notice silent degradation (writes dropping, retrieval starving).
// Everything here is observational; no control flow reads it back.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

use crate::atoms::types::PlannerDecision;

// ── Write-path stats ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub events_queued: u64,
    pub message_events_queued: u64,
    pub tool_events_queued: u64,
    /// Commits observed by the bridge; sync commits count here too even
    /// though nothing was literally enqueued.
    pub commit_events_queued: u64,
    pub sync_commits: u64,
    pub async_commits: u64,
    pub periodic_commits_by_message: u64,
    pub periodic_commits_by_time: u64,
    pub session_end_commits: u64,
    pub reset_commits: u64,
    pub manual_commits: u64,
    pub last_commit_cause: Option<String>,
    pub last_commit_source: Option<String>,
    pub last_commit_mode: Option<String>,
    /// Commit-queued time minus last-event-queued time.
    pub last_commit_lag_ms: Option<i64>,
    pub last_periodic_trigger: Option<String>,
    pub last_periodic_trigger_at: Option<i64>,
    pub last_event_queued_at: Option<i64>,
    pub last_error: Option<String>,
}

// ── Read-path snapshots ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainabilitySnapshot {
    pub query_preview: String,
    pub typed_queries: usize,
    pub result_count: usize,
    /// Up to five planner queries, highest priority first.
    pub top_planner_queries: Vec<String>,
    pub fallback_kind: Option<String>,
    pub fallback_hits: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySnapshot {
    pub decision: PlannerDecision,
    pub session_linked: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayeringSnapshot {
    pub requested_layer: String,
    pub entries: usize,
    pub snippet_chars: usize,
    pub injected_chars: usize,
    pub l0_count: usize,
    pub l1_count: usize,
    pub l2_count: usize,
    pub truncated_by_budget: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationExpansionSnapshot {
    pub enabled: bool,
    pub boost_applied: bool,
    pub max_depth: usize,
    pub max_anchors: usize,
    pub max_expanded_entries: usize,
    pub anchors_selected: usize,
    pub seed_anchors: usize,
    pub relation_queries: usize,
    pub discovered: usize,
    pub expanded_candidates: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSnapshot {
    pub total_candidates: usize,
    pub direct_candidates: usize,
    pub relation_candidates: usize,
    pub filtered_candidates: usize,
    pub selected_candidates: usize,
    pub emitted_candidates: usize,
    pub dropped_by_max_entries: usize,
    pub dropped_by_budget: usize,
    pub skipped_empty_snippet: usize,
}

/// Everything the last search left behind for one (agent, endpoint).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDiagnostics {
    pub bridge: BridgeStats,
    pub last_explainability: Option<ExplainabilitySnapshot>,
    pub last_strategy: Option<StrategySnapshot>,
    pub last_layering: Option<LayeringSnapshot>,
    pub last_relation_expansion: Option<RelationExpansionSnapshot>,
    pub last_ranking: Option<RankingSnapshot>,
}

/// One retrieval's worth of snapshots, recorded atomically.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRecord {
    pub explainability: ExplainabilitySnapshot,
    pub strategy: Option<StrategySnapshot>,
    pub layering: LayeringSnapshot,
    pub relation_expansion: RelationExpansionSnapshot,
    pub ranking: RankingSnapshot,
}

// ── Hub ────────────────────────────────────────────────────────────────────

type DiagKey = (String, String);

/// Process-wide (but injectable) diagnostics store, keyed by
/// (agentId, endpoint). Tests construct their own hub; production shares
/// one per registry.
#[derive(Default)]
pub struct DiagnosticsHub {
    inner: Mutex<HashMap<DiagKey, AgentDiagnostics>>,
}

impl DiagnosticsHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(agent_id: &str, endpoint: &str) -> DiagKey {
        (agent_id.to_string(), endpoint.to_string())
    }

    /// Mutate the bridge stats for one key under the hub lock.
    pub fn with_bridge_stats<F>(&self, agent_id: &str, endpoint: &str, mutate: F)
    where
        F: FnOnce(&mut BridgeStats),
    {
        let mut inner = self.inner.lock();
        let entry = inner.entry(Self::key(agent_id, endpoint)).or_default();
        mutate(&mut entry.bridge);
    }

    /// Replace the retrieval snapshots for one key.
    pub fn record_retrieval(&self, agent_id: &str, endpoint: &str, record: RetrievalRecord) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(Self::key(agent_id, endpoint)).or_default();
        entry.last_explainability = Some(record.explainability);
        entry.last_strategy = record.strategy;
        entry.last_layering = Some(record.layering);
        entry.last_relation_expansion = Some(record.relation_expansion);
        entry.last_ranking = Some(record.ranking);
    }

    pub fn snapshot(&self, agent_id: &str, endpoint: &str) -> AgentDiagnostics {
        self.inner.lock().get(&Self::key(agent_id, endpoint)).cloned().unwrap_or_default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
