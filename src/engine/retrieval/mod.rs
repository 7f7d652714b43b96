// ── Viking Bridge: Read Pipeline ───────────────────────────────────────────
//
// One complete retrieval for one query, producing ranked snippet rows fit
// for injection into the agent's prompt:
//
//   A. primary search against the store
//   B. planner decision (strategy, bucket priority, inclusion flags)
//   C. context gathering across the included buckets
//   D. keyword-find fallback when the primary search comes back empty
//   E. direct ranking (store score + priority bonus)
//   F. optional relation expansion (relations.rs)
//   G. filter, sort, truncate to the entry cap
//   H. layered snippet assembly under character budgets (layering.rs)
//
// Every phase records into the per-(agent, endpoint) diagnostics so a host
// operator can see why a given turn got the context it did. Transport
// failures during snippet loads degrade to thinner layers; only the primary
// search surfaces an error to the caller.

mod layering;
mod relations;

pub use layering::SnippetResult;

use log::{info, warn};
use std::sync::Arc;

use crate::atoms::constants::{
    MEMORY_BASE_BONUS, PRIORITY_MATCH_BONUS, RESOURCE_URI_ROOT, VIKING_SCHEME,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    CandidateOrigin, ContextHit, ContextKind, PlannerDecision, RankedCandidate,
    ResolvedMemoryConfig, SearchResponse,
};
use crate::engine::client::VikingStore;
use crate::engine::diagnostics::{
    DiagnosticsHub, ExplainabilitySnapshot, RankingSnapshot, RelationExpansionSnapshot,
    RetrievalRecord, StrategySnapshot,
};
use crate::engine::planner;
use crate::engine::session_link::SessionLinkRegistry;

// ── Options & results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadFileResult {
    pub text: String,
    /// The normalized `viking://` uri that was read.
    pub path: String,
}

// ── Pipeline ───────────────────────────────────────────────────────────────

pub struct ReadPipeline {
    agent_id: String,
    config: ResolvedMemoryConfig,
    store: Arc<dyn VikingStore>,
    links: Arc<SessionLinkRegistry>,
    diagnostics: Arc<DiagnosticsHub>,
}

impl ReadPipeline {
    pub fn new(
        agent_id: impl Into<String>,
        config: ResolvedMemoryConfig,
        store: Arc<dyn VikingStore>,
        links: Arc<SessionLinkRegistry>,
        diagnostics: Arc<DiagnosticsHub>,
    ) -> Self {
        Self { agent_id: agent_id.into(), config, store, links, diagnostics }
    }

    /// Run the full pipeline for one query.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> EngineResult<Vec<SnippetResult>> {
        // Phase A: primary search.
        let query = query.trim();
        if query.is_empty() || !self.config.enabled {
            return Ok(Vec::new());
        }

        let search_cfg = &self.config.search;
        let config_limit = search_cfg.effective_limit();
        let limit = options.max_results.unwrap_or(config_limit).min(config_limit);
        let score_threshold = options.min_score.or(search_cfg.score_threshold);
        let session_id = match &options.session_key {
            Some(key) => self.links.linked_session_id(key).await,
            None => None,
        };
        let target_uri = search_cfg.effective_target_uri();

        let response = self
            .store
            .search(query, target_uri, session_id.as_deref(), limit, score_threshold)
            .await?;

        // Phase B: planning.
        let decision = planner::plan(
            search_cfg,
            query,
            options.session_key.is_some(),
            response.query_plan.as_ref(),
            &response.query_results,
        );

        // Phase C: context gathering.
        let mut contexts = gather_contexts(&response, &decision);

        // Phase D: keyword-find fallback.
        let mut fallback_kind: Option<&str> = None;
        let mut fallback_hits = 0usize;
        if contexts.is_empty() {
            match self
                .store
                .find(query, target_uri, session_id.as_deref(), limit, score_threshold)
                .await
            {
                Ok(fallback) => {
                    contexts = gather_contexts(&fallback, &decision);
                    fallback_hits = contexts.len();
                    fallback_kind = Some("find");
                }
                Err(e) => warn!("[retrieval] find fallback failed: {e}"),
            }
        }

        // Phase E: direct ranking.
        let direct: Vec<RankedCandidate> = contexts
            .into_iter()
            .map(|(kind, hit)| {
                let score = hit.score.unwrap_or(0.0);
                RankedCandidate {
                    kind,
                    score,
                    rank: score + rank_bonus(kind, decision.priority),
                    context: hit,
                    origin: CandidateOrigin::Direct,
                    relation_from: None,
                    relation_depth: 0,
                    relation_reason: None,
                }
            })
            .collect();

        // Phase F: relation expansion.
        let (relation_candidates, relation_snapshot) = if search_cfg.relation_expansion {
            let out = relations::expand_relations(
                &*self.store,
                &direct,
                &decision,
                search_cfg,
                response.query_plan.as_ref(),
            )
            .await;
            (out.candidates, out.snapshot)
        } else {
            (Vec::new(), RelationExpansionSnapshot::default())
        };

        // Phase G: filter & sort.
        let direct_count = direct.len();
        let relation_count = relation_candidates.len();
        let total_candidates = direct_count + relation_count;

        let mut combined = direct;
        combined.extend(relation_candidates);
        if let Some(min_score) = options.min_score {
            combined.retain(|c| c.score >= min_score);
        }
        let filtered_count = combined.len();
        combined.sort_by(|a, b| {
            b.rank
                .partial_cmp(&a.rank)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });
        let hard_limit = limit.min(search_cfg.effective_max_entries()).max(1);
        let dropped_by_max_entries = filtered_count.saturating_sub(hard_limit);
        combined.truncate(hard_limit);
        let selected_count = combined.len();

        // Phase H: layered snippet assembly.
        let assembly = layering::assemble_snippets(
            &*self.store,
            &combined,
            search_cfg.read_layer,
            search_cfg.effective_max_snippet_chars(),
            search_cfg.effective_max_injected_chars(),
            search_cfg.relation_expansion,
        )
        .await;

        // Diagnostics.
        let record = RetrievalRecord {
            explainability: ExplainabilitySnapshot {
                query_preview: query.chars().take(80).collect(),
                typed_queries: response.query_plan.as_ref().map(|p| p.queries.len()).unwrap_or(0),
                result_count: direct_count,
                top_planner_queries: top_planner_queries(&response),
                fallback_kind: fallback_kind.map(str::to_string),
                fallback_hits,
            },
            strategy: Some(StrategySnapshot {
                decision: decision.clone(),
                session_linked: session_id.is_some(),
            }),
            layering: assembly.layering.clone(),
            relation_expansion: relation_snapshot,
            ranking: RankingSnapshot {
                total_candidates,
                direct_candidates: direct_count,
                relation_candidates: relation_count,
                filtered_candidates: filtered_count,
                selected_candidates: selected_count,
                emitted_candidates: assembly.results.len(),
                dropped_by_max_entries,
                dropped_by_budget: assembly.dropped_by_budget,
                skipped_empty_snippet: assembly.skipped_empty_snippet,
            },
        };
        self.diagnostics.record_retrieval(&self.agent_id, &self.config.endpoint, record);

        info!(
            "[retrieval] '{}' → {} rows ({} direct, {} relation, priority {})",
            query.chars().take(50).collect::<String>(),
            assembly.results.len(),
            direct_count,
            relation_count,
            decision.priority.as_str(),
        );
        Ok(assembly.results)
    }

    // ── Direct file reads ──────────────────────────────────────────────────

    /// Read one store document by host-relative path, optionally slicing
    /// 1-indexed lines `[from, from + lines)`.
    pub async fn read_file(
        &self,
        rel_path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> EngineResult<ReadFileResult> {
        let trimmed = rel_path.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("read_file: empty path".into()));
        }
        let uri = normalize_read_uri(trimmed);
        let text = self.store.read_content(&uri).await?;

        let text = if from.is_some() || lines.is_some() {
            let start = from.unwrap_or(1).max(1);
            let sliced = text.lines().skip(start - 1);
            match lines {
                Some(count) => sliced.take(count).collect::<Vec<_>>().join("\n"),
                None => sliced.collect::<Vec<_>>().join("\n"),
            }
        } else {
            text
        };

        Ok(ReadFileResult { text, path: uri })
    }
}

// ── Shared ranking math ────────────────────────────────────────────────────

/// Priority-matched kinds get the full bonus; memories keep a small edge
/// otherwise so conversational context never vanishes entirely.
pub(crate) fn rank_bonus(kind: ContextKind, priority: ContextKind) -> f64 {
    if kind == priority {
        PRIORITY_MATCH_BONUS
    } else if kind == ContextKind::Memory {
        MEMORY_BASE_BONUS
    } else {
        0.0
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn gather_contexts(
    response: &SearchResponse,
    decision: &PlannerDecision,
) -> Vec<(ContextKind, ContextHit)> {
    let mut contexts: Vec<(ContextKind, ContextHit)> =
        response.memories.iter().cloned().map(|hit| (ContextKind::Memory, hit)).collect();
    if decision.include_resources {
        contexts.extend(response.resources.iter().cloned().map(|hit| (ContextKind::Resource, hit)));
    }
    if decision.include_skills {
        contexts.extend(response.skills.iter().cloned().map(|hit| (ContextKind::Skill, hit)));
    }
    contexts
}

/// The five highest-priority planner queries (priority 1 is highest).
fn top_planner_queries(response: &SearchResponse) -> Vec<String> {
    let Some(plan) = &response.query_plan else { return Vec::new() };
    let mut queries: Vec<(i64, String)> =
        plan.queries.iter().map(|q| (q.priority.unwrap_or(3), q.query.clone())).collect();
    queries.sort_by_key(|(priority, _)| *priority);
    queries.into_iter().take(5).map(|(_, query)| query).collect()
}

/// Normalize a host path to a `viking://` uri: scheme-prefixed input passes
/// through, an absolute path mounts under the resource root, anything else
/// is resource-relative.
pub fn normalize_read_uri(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with(VIKING_SCHEME) {
        trimmed.to_string()
    } else if trimmed.starts_with('/') {
        format!("viking://resource{trimmed}")
    } else {
        format!("{RESOURCE_URI_ROOT}{trimmed}")
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{QueryPlan, RelationEntry, TypedQuery};
    use crate::engine::testing::{FakeStore, LayeredContent};
    use std::sync::atomic::Ordering;

    fn hit(uri: &str, score: f64, overview: &str) -> ContextHit {
        ContextHit {
            uri: uri.to_string(),
            score: Some(score),
            overview: Some(overview.to_string()),
            ..Default::default()
        }
    }

    fn pipeline_with(
        store: Arc<FakeStore>,
        config: ResolvedMemoryConfig,
    ) -> (ReadPipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let links = Arc::new(SessionLinkRegistry::new(dir.path().join("sessions.json")));
        let pipeline = ReadPipeline::new(
            "agent:test",
            config,
            store,
            links,
            Arc::new(DiagnosticsHub::new()),
        );
        (pipeline, dir)
    }

    fn enabled_config() -> ResolvedMemoryConfig {
        let mut config = ResolvedMemoryConfig::default();
        config.enabled = true;
        config.endpoint = "http://store".into();
        config
    }

    #[tokio::test]
    async fn empty_query_short_circuits_without_store_calls() {
        let store = Arc::new(FakeStore::new());
        let (pipeline, _dir) = pipeline_with(store, enabled_config());
        let rows = pipeline.search("   ", &SearchOptions::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn disabled_backend_reads_as_empty() {
        let mut config = enabled_config();
        config.enabled = false;
        let (pipeline, _dir) = pipeline_with(Arc::new(FakeStore::new()), config);
        let rows = pipeline.search("anything", &SearchOptions::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn direct_hits_are_ranked_and_emitted() {
        let response = SearchResponse {
            memories: vec![
                hit("viking://session/s1", 0.5, "older conversation context"),
                hit("viking://session/s2", 0.9, "fresher conversation context"),
            ],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        let rows = pipeline.search("what did we decide", &SearchOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, "viking://session/s2");
        assert_eq!(rows[0].start_line, 1);
        assert_eq!(rows[0].end_line, 1);
        assert_eq!(rows[0].source, "openviking");
    }

    #[tokio::test]
    async fn emitted_rows_respect_all_three_caps() {
        let response = SearchResponse {
            memories: (0..9)
                .map(|n| hit(&format!("viking://session/m{n}"), 0.9, "context overview text"))
                .collect(),
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        let rows = pipeline
            .search("q", &SearchOptions { max_results: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn zero_max_results_reaches_the_store_unfloored() {
        // The effective limit is min(maxResults, configLimit) with no floor:
        // a caller asking for zero results gets a zero-limit search (and a
        // zero-limit find fallback), not a forced one.
        let store = Arc::new(FakeStore::new());
        let (pipeline, _dir) = pipeline_with(Arc::clone(&store), enabled_config());

        let rows = pipeline
            .search("q", &SearchOptions { max_results: Some(0), ..Default::default() })
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(*store.search_limits.lock(), vec![0]);
        assert_eq!(*store.find_limits.lock(), vec![0]);
    }

    #[tokio::test]
    async fn min_score_filters_before_truncation() {
        let response = SearchResponse {
            memories: vec![
                hit("viking://session/high", 0.9, "strong match overview"),
                hit("viking://session/low", 0.1, "weak match overview"),
            ],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        let rows = pipeline
            .search("q", &SearchOptions { min_score: Some(0.5), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "viking://session/high");
    }

    #[tokio::test]
    async fn find_fallback_rescues_empty_primary_search() {
        let fallback = SearchResponse {
            memories: vec![hit("viking://session/kw", 0.4, "keyword matched overview")],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_find(fallback));
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        let rows = pipeline.search("needle", &SearchOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "viking://session/kw");

        let diag = pipeline.diagnostics.snapshot("agent:test", "http://store");
        let explain = diag.last_explainability.unwrap();
        assert_eq!(explain.fallback_kind.as_deref(), Some("find"));
        assert_eq!(explain.fallback_hits, 1);
    }

    #[tokio::test]
    async fn budget_truncation_is_visible_in_diagnostics() {
        // Two 80-char overviews against a 50-char injection budget.
        let mut config = enabled_config();
        config.search.max_entries = 2;
        config.search.max_snippet_chars = 80;
        config.search.max_injected_chars = 50;
        config.search.read_layer = crate::atoms::types::ReadLayer::L1;
        let response = SearchResponse {
            memories: vec![
                hit("viking://session/a", 0.9, &"A".repeat(80)),
                hit("viking://session/b", 0.8, &"B".repeat(80)),
            ],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, config);

        let rows = pipeline.search("q", &SearchOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].snippet.chars().count() <= 50);

        let diag = pipeline.diagnostics.snapshot("agent:test", "http://store");
        assert!(diag.last_layering.unwrap().truncated_by_budget);
        assert_eq!(diag.last_ranking.unwrap().dropped_by_budget, 1);
    }

    #[tokio::test]
    async fn planner_decision_lands_in_strategy_snapshot() {
        let response = SearchResponse {
            memories: vec![hit("viking://session/m", 0.5, "memory overview here")],
            query_plan: Some(QueryPlan {
                queries: vec![
                    TypedQuery {
                        context_type: Some("resource".into()),
                        priority: Some(4),
                        query: "find the doc".into(),
                        ..Default::default()
                    },
                    TypedQuery {
                        context_type: Some("skill".into()),
                        priority: Some(1),
                        query: "how to deploy".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        pipeline
            .search("show config file documentation path", &SearchOptions::default())
            .await
            .unwrap();

        let diag = pipeline.diagnostics.snapshot("agent:test", "http://store");
        let strategy = diag.last_strategy.unwrap();
        assert_eq!(strategy.decision.priority, ContextKind::Skill);
        assert!(strategy.decision.reason.starts_with("auto-planner-plan"));
        assert!(strategy.decision.include_resources);
        assert!(strategy.decision.include_skills);

        let explain = diag.last_explainability.unwrap();
        assert_eq!(explain.typed_queries, 2);
        assert_eq!(explain.top_planner_queries[0], "how to deploy");
    }

    #[tokio::test]
    async fn planner_seed_expands_into_the_only_emitted_row() {
        // Primary search and fallback both empty; the planner's target
        // directory seeds a relation anchor which discovers one neighbor.
        let mut config = enabled_config();
        config.search.relation_expansion = true;
        config.search.relation_max_depth = 1;
        config.search.relation_max_anchors = 2;
        config.search.relation_max_expanded_entries = 2;
        config.search.read_layer = crate::atoms::types::ReadLayer::L1;

        let response = SearchResponse {
            query_plan: Some(QueryPlan {
                queries: vec![TypedQuery {
                    target_directories: vec!["viking://resource/docs/root".into()],
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        store.link(
            "viking://resource/docs/root",
            vec![RelationEntry {
                uri: "viking://resource/docs/from-seed".into(),
                reason: Some("seed-link".into()),
                context_type: None,
            }],
        );
        store.set_content(
            "viking://resource/docs/from-seed",
            LayeredContent {
                overview: Some("overview of the seeded document".into()),
                ..Default::default()
            },
        );
        let (pipeline, _dir) = pipeline_with(store, config);

        let rows = pipeline.search("docs", &SearchOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "viking://resource/docs/from-seed");
        assert!(rows[0].snippet.contains("[relation-expanded"));

        let diag = pipeline.diagnostics.snapshot("agent:test", "http://store");
        let relation = diag.last_relation_expansion.unwrap();
        assert_eq!(relation.seed_anchors, 1);
        assert_eq!(relation.discovered, 1);
    }

    #[tokio::test]
    async fn planner_exclusions_keep_buckets_out_of_ranking() {
        // include flags off and no signals: skills/resources are returned by
        // the store but never gathered.
        let mut config = enabled_config();
        config.search.include_resources = false;
        config.search.include_skills = false;
        let response = SearchResponse {
            memories: vec![hit("viking://session/m", 0.2, "memory overview")],
            resources: vec![hit("viking://resource/r", 0.9, "resource overview")],
            skills: vec![hit("viking://skills/s", 0.9, "skill overview")],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(store, config);

        let rows = pipeline.search("hello again", &SearchOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "viking://session/m");
    }

    #[tokio::test]
    async fn find_failure_degrades_to_empty_rows() {
        let store = Arc::new(FakeStore::new());
        store.fail_relations_for.lock().push("unused".into());
        // Both search and find return empty; no candidates, no rows, no error.
        let (pipeline, _dir) = pipeline_with(store, enabled_config());
        let rows = pipeline.search("nothing known", &SearchOptions::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn read_file_normalizes_paths_and_slices_lines() {
        let store = Arc::new(FakeStore::new());
        store.set_content(
            "viking://resource/notes/today.md",
            LayeredContent {
                read: Some("line1\nline2\nline3\nline4\nline5".into()),
                ..Default::default()
            },
        );
        let (pipeline, _dir) = pipeline_with(store, enabled_config());

        // Relative path mounts under the resource root.
        let out = pipeline.read_file("notes/today.md", None, None).await.unwrap();
        assert_eq!(out.path, "viking://resource/notes/today.md");
        assert_eq!(out.text.lines().count(), 5);

        // 1-indexed [from, from+lines).
        let out = pipeline.read_file("notes/today.md", Some(2), Some(3)).await.unwrap();
        assert_eq!(out.text, "line2\nline3\nline4");
    }

    #[tokio::test]
    async fn read_file_uri_forms_round_trip() {
        assert_eq!(normalize_read_uri("viking://skills/howto"), "viking://skills/howto");
        assert_eq!(normalize_read_uri("/abs/path"), "viking://resource/abs/path");
        assert_eq!(normalize_read_uri("rel/path.md"), "viking://resource/rel/path.md");
    }

    #[tokio::test]
    async fn session_key_resolves_linked_store_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions.json");
        std::fs::write(&sessions, r#"{"k":{"openvikingSessionId":"s-7"}}"#).unwrap();

        let response = SearchResponse {
            memories: vec![hit("viking://session/s-7", 0.6, "session scoped overview")],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let links = Arc::new(SessionLinkRegistry::new(&sessions));
        let pipeline = ReadPipeline::new(
            "agent:test",
            enabled_config(),
            store,
            links,
            Arc::new(DiagnosticsHub::new()),
        );

        pipeline
            .search(
                "q",
                &SearchOptions { session_key: Some("k".into()), ..Default::default() },
            )
            .await
            .unwrap();
        let diag = pipeline.diagnostics.snapshot("agent:test", "http://store");
        assert!(diag.last_strategy.unwrap().session_linked);
    }

    #[tokio::test]
    async fn successful_search_skips_the_find_fallback() {
        let response = SearchResponse {
            memories: vec![hit("viking://session/m", 0.5, "overview text here")],
            ..Default::default()
        };
        let store = Arc::new(FakeStore::new().with_search(response));
        let (pipeline, _dir) = pipeline_with(Arc::clone(&store), enabled_config());
        pipeline.search("q", &SearchOptions::default()).await.unwrap();

        assert_eq!(store.search_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.find_calls.load(Ordering::SeqCst), 0);
    }
}
