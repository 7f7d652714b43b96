// ── Viking Bridge: Relation Expansion ──────────────────────────────────────
//
// Widens a ranked result set by walking the store's relation graph outward
// from the best direct hits (and, when the direct set is thin, from the
// planner's target directories) under hard global budgets:
//
//   relations calls  ≤ max(maxAnchors, maxExpandedEntries · maxDepth)
//   discovered uris  ≤ maxExpandedEntries
//
// Relation-origin candidates score below their anchor and decay with hop
// depth, so a direct hit always outranks its own neighborhood. A relations
// failure at one anchor skips that anchor; the others still expand.

use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::atoms::constants::{
    RELATION_DEPTH_RANK_DECAY, RELATION_DEPTH_SCORE_DECAY, RELATION_RANK_PENALTY,
    RELATION_SCORE_PENALTY,
};
use crate::atoms::types::{
    CandidateOrigin, ContextHit, ContextKind, PlannerDecision, QueryPlan, RankedCandidate,
    SearchConfig,
};
use crate::engine::client::VikingStore;
use crate::engine::diagnostics::RelationExpansionSnapshot;

use super::rank_bonus;

// ── Anchors ────────────────────────────────────────────────────────────────

struct Anchor {
    uri: String,
    score: f64,
    seeded: bool,
}

pub(crate) struct ExpansionOutput {
    pub candidates: Vec<RankedCandidate>,
    pub snapshot: RelationExpansionSnapshot,
}

// ── Expansion ──────────────────────────────────────────────────────────────

pub(crate) async fn expand_relations(
    store: &dyn VikingStore,
    direct: &[RankedCandidate],
    decision: &PlannerDecision,
    config: &SearchConfig,
    query_plan: Option<&QueryPlan>,
) -> ExpansionOutput {
    // Priority boost: non-memory priorities get wider budgets when enabled.
    let boost_applied =
        config.relation_priority_budget_boost && decision.priority != ContextKind::Memory;
    let bonus = |base: usize, extra: usize| if boost_applied { base + extra } else { base };

    let max_depth = bonus(
        config.effective_relation_max_depth(),
        config.effective_relation_priority_depth_bonus(),
    );
    let max_anchors = bonus(
        config.effective_relation_max_anchors(),
        config.effective_relation_priority_anchors_bonus(),
    );
    let max_expanded = bonus(
        config.effective_relation_max_expanded_entries(),
        config.effective_relation_priority_expanded_bonus(),
    );
    let query_budget = max_anchors.max(max_expanded * max_depth);

    let (anchors, seed_anchors) =
        select_anchors(direct, config, query_plan, max_anchors);

    let mut snapshot = RelationExpansionSnapshot {
        enabled: true,
        boost_applied,
        max_depth,
        max_anchors,
        max_expanded_entries: max_expanded,
        anchors_selected: anchors.len(),
        seed_anchors,
        ..Default::default()
    };

    if anchors.is_empty() || max_depth == 0 {
        return ExpansionOutput { candidates: Vec::new(), snapshot };
    }

    let direct_uris: HashSet<&str> = direct.iter().map(|c| c.context.uri.as_str()).collect();
    let mut visited: HashSet<String> =
        anchors.iter().map(|a| a.uri.clone()).collect();
    let mut best: HashMap<String, RankedCandidate> = HashMap::new();
    let mut queries = 0usize;

    'anchors: for anchor in &anchors {
        // (uri to expand, hop depth of its children)
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((anchor.uri.clone(), 0));

        while let Some((uri, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            if queries >= query_budget {
                break 'anchors;
            }
            queries += 1;

            let neighbors = match store.relations(&uri).await {
                Ok(neighbors) => neighbors,
                Err(e) => {
                    warn!("[retrieval] relations({uri}) failed, skipping anchor: {e}");
                    continue 'anchors;
                }
            };

            let child_depth = depth + 1;
            for neighbor in neighbors {
                if neighbor.uri.is_empty() || direct_uris.contains(neighbor.uri.as_str()) {
                    continue;
                }

                let is_new = !best.contains_key(&neighbor.uri);
                if is_new && best.len() >= max_expanded {
                    debug!("[retrieval] relation expansion budget reached");
                    break 'anchors;
                }

                let kind = neighbor
                    .context_type
                    .as_deref()
                    .and_then(parse_kind)
                    .unwrap_or_else(|| ContextKind::infer_from_uri(&neighbor.uri));
                let score = (anchor.score
                    - child_depth as f64 * RELATION_DEPTH_SCORE_DECAY
                    - RELATION_SCORE_PENALTY)
                    .max(0.0);
                let rank = score + rank_bonus(kind, decision.priority)
                    - RELATION_RANK_PENALTY
                    - child_depth as f64 * RELATION_DEPTH_RANK_DECAY;

                let candidate = RankedCandidate {
                    kind,
                    context: ContextHit { uri: neighbor.uri.clone(), ..Default::default() },
                    score,
                    rank,
                    origin: CandidateOrigin::Relation,
                    relation_from: Some(uri.clone()),
                    relation_depth: child_depth,
                    relation_reason: neighbor.reason.clone(),
                };

                // Keep the best-ranked instance per uri.
                match best.get(&neighbor.uri) {
                    Some(existing) if existing.rank >= rank => {}
                    _ => {
                        best.insert(neighbor.uri.clone(), candidate);
                    }
                }

                if child_depth < max_depth && visited.insert(neighbor.uri.clone()) {
                    queue.push_back((neighbor.uri, child_depth));
                }
            }
        }
    }

    snapshot.relation_queries = queries;
    snapshot.discovered = best.len();
    snapshot.expanded_candidates = best.len();

    let mut candidates: Vec<RankedCandidate> = best.into_values().collect();
    candidates.sort_by(|a, b| {
        b.rank
            .partial_cmp(&a.rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });
    ExpansionOutput { candidates, snapshot }
}

// ── Anchor selection ───────────────────────────────────────────────────────

/// Top direct candidates by rank then score, deduplicated by uri, topped up
/// with planner target-directory seeds while room remains.
fn select_anchors(
    direct: &[RankedCandidate],
    config: &SearchConfig,
    query_plan: Option<&QueryPlan>,
    max_anchors: usize,
) -> (Vec<Anchor>, usize) {
    let mut ordered: Vec<&RankedCandidate> = direct.iter().collect();
    ordered.sort_by(|a, b| {
        b.rank
            .partial_cmp(&a.rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut anchors: Vec<Anchor> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for candidate in ordered {
        if anchors.len() >= max_anchors {
            break;
        }
        if seen.insert(candidate.context.uri.as_str()) {
            anchors.push(Anchor {
                uri: candidate.context.uri.clone(),
                score: candidate.score,
                seeded: false,
            });
        }
    }

    // Planner-directory seeds fill the remaining anchor slots.
    let seed_score = config.effective_relation_seed_anchor_score();
    if let Some(plan) = query_plan {
        for typed in &plan.queries {
            for dir in &typed.target_directories {
                if anchors.len() >= max_anchors {
                    break;
                }
                if dir.is_empty() || anchors.iter().any(|a| a.uri == *dir) {
                    continue;
                }
                anchors.push(Anchor { uri: dir.clone(), score: seed_score, seeded: true });
            }
        }
    }

    let seeds = anchors.iter().filter(|a| a.seeded).count();
    (anchors, seeds)
}

fn parse_kind(raw: &str) -> Option<ContextKind> {
    match raw {
        "memory" => Some(ContextKind::Memory),
        "resource" => Some(ContextKind::Resource),
        "skill" => Some(ContextKind::Skill),
        _ => None,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
