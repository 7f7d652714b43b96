// ── Viking Bridge: Retrieval Planner ───────────────────────────────────────
//
// Decides which context bucket leads a retrieval (memory / resource /
// skill) and which extra buckets get consulted. Pure function of the
// configured strategy, the query text, session presence, and the planner
// signals the store returned alongside the search hits.
//
// Resolution order:
//   1. a configured *_first strategy pins the priority outright
//   2. store planner signals (query_plan priorities, query_result matches)
//      are weighted; a uniquely dominant context type wins
//   3. lexical heuristics over the query tokens
//   4. memory, the safe default

use std::collections::HashMap;

use crate::atoms::types::{
    ContextKind, PlannerDecision, QueryPlan, QueryResultSignal, SearchConfig, SearchStrategy,
};

// ── Lexicons ───────────────────────────────────────────────────────────────
// Query tokens that imply the user is after files/documents vs. procedures.

const RESOURCE_SIGNALS: &[&str] = &[
    "file", "files", "path", "paths", "readme", "markdown", "doc", "docs", "document",
    "documents", "documentation", "resource", "resources", "code", "source", "config",
    "configuration", "api", "schema", "spec", "reference", "directory", "folder",
];

const SKILL_SIGNALS: &[&str] = &[
    "how", "howto", "plan", "steps", "step", "workflow", "playbook", "guide", "template",
    "skill", "skills", "strategy", "process", "procedure", "checklist", "recipe",
    "instructions", "tutorial",
];

// ── Entry point ────────────────────────────────────────────────────────────

pub fn plan(
    config: &SearchConfig,
    query: &str,
    has_session: bool,
    query_plan: Option<&QueryPlan>,
    query_results: &[QueryResultSignal],
) -> PlannerDecision {
    // 1. Configured strategies pin the priority and promote their bucket.
    match config.strategy {
        SearchStrategy::MemoryFirst => {
            return PlannerDecision {
                strategy: config.strategy,
                reason: "configured-memory-first".into(),
                priority: ContextKind::Memory,
                include_resources: config.include_resources,
                include_skills: config.include_skills,
            };
        }
        SearchStrategy::ResourceFirst => {
            return PlannerDecision {
                strategy: config.strategy,
                reason: "configured-resource-first".into(),
                priority: ContextKind::Resource,
                include_resources: true,
                include_skills: config.include_skills,
            };
        }
        SearchStrategy::SkillFirst => {
            return PlannerDecision {
                strategy: config.strategy,
                reason: "configured-skill-first".into(),
                priority: ContextKind::Skill,
                include_resources: config.include_resources,
                include_skills: true,
            };
        }
        SearchStrategy::Auto => {}
    }

    // 2. Store planner signals.
    let plan_weights = weigh_query_plan(query_plan);
    let result_weights = weigh_query_results(query_results);

    let mut combined: HashMap<ContextKind, u32> = HashMap::new();
    for (kind, weight) in plan_weights.iter().chain(result_weights.iter()) {
        *combined.entry(*kind).or_default() += weight;
    }

    if let Some(winner) = uniquely_dominant(&combined) {
        let source = match (!plan_weights.is_empty(), !result_weights.is_empty()) {
            (true, true) => "auto-planner-combined",
            (true, false) => "auto-planner-plan",
            (false, true) => "auto-planner-results",
            (false, false) => unreachable!("dominant kind requires at least one signal"),
        };
        let reason =
            if has_session { format!("{source}-session") } else { source.to_string() };
        return PlannerDecision {
            strategy: SearchStrategy::Auto,
            reason,
            priority: winner,
            include_resources: config.include_resources
                || combined.get(&ContextKind::Resource).copied().unwrap_or(0) > 0,
            include_skills: config.include_skills
                || combined.get(&ContextKind::Skill).copied().unwrap_or(0) > 0,
        };
    }

    // 3. Lexical heuristics over the raw query.
    let (resource_hits, skill_hits) = count_signal_hits(query);
    let include_resources = config.include_resources || resource_hits > 0;
    let include_skills = config.include_skills || skill_hits > 0;

    let (priority, reason) = if resource_hits > skill_hits {
        (ContextKind::Resource, "auto-lexical-resource")
    } else if skill_hits > resource_hits {
        (ContextKind::Skill, "auto-lexical-skill")
    } else if resource_hits > 0 {
        // Tied and non-zero: resources win.
        (ContextKind::Resource, "auto-lexical-resource")
    } else {
        (ContextKind::Memory, "auto-default-memory")
    };

    PlannerDecision {
        strategy: SearchStrategy::Auto,
        reason: reason.into(),
        priority,
        include_resources,
        include_skills,
    }
}

// ── Signal weighting ───────────────────────────────────────────────────────

/// Query-plan priorities map to weights: 1→5, 2→4, 3→3, 4→2, else 1.
fn weigh_query_plan(query_plan: Option<&QueryPlan>) -> HashMap<ContextKind, u32> {
    let mut weights = HashMap::new();
    let Some(plan) = query_plan else { return weights };
    for typed in &plan.queries {
        let Some(kind) = parse_kind(typed.context_type.as_deref()) else { continue };
        let weight = match typed.priority.unwrap_or(3) {
            1 => 5,
            2 => 4,
            3 => 3,
            4 => 2,
            _ => 1,
        };
        *weights.entry(kind).or_default() += weight;
    }
    weights
}

/// Query-result signals weigh by matched-context count, clamped to 1..=5.
fn weigh_query_results(query_results: &[QueryResultSignal]) -> HashMap<ContextKind, u32> {
    let mut weights = HashMap::new();
    for signal in query_results {
        let Some(kind) = parse_kind(signal.context_type.as_deref()) else { continue };
        let count = signal.matched_contexts.unwrap_or(0);
        let weight = count.clamp(1, 5) as u32;
        *weights.entry(kind).or_default() += weight;
    }
    weights
}

fn parse_kind(raw: Option<&str>) -> Option<ContextKind> {
    match raw? {
        "memory" => Some(ContextKind::Memory),
        "resource" => Some(ContextKind::Resource),
        "skill" => Some(ContextKind::Skill),
        _ => None,
    }
}

/// The winner must be strictly heavier than every other kind.
fn uniquely_dominant(weights: &HashMap<ContextKind, u32>) -> Option<ContextKind> {
    let (&best_kind, &best_weight) = weights.iter().max_by_key(|(_, w)| **w)?;
    if best_weight == 0 {
        return None;
    }
    let contested =
        weights.iter().any(|(kind, weight)| *kind != best_kind && *weight == best_weight);
    if contested { None } else { Some(best_kind) }
}

// ── Lexical heuristics ─────────────────────────────────────────────────────

fn count_signal_hits(query: &str) -> (usize, usize) {
    let lowered = query.to_lowercase();
    let tokens: Vec<&str> =
        lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()).collect();
    let resource = tokens.iter().filter(|t| RESOURCE_SIGNALS.contains(&**t)).count();
    let skill = tokens.iter().filter(|t| SKILL_SIGNALS.contains(&**t)).count();
    (resource, skill)
}

// ── Tests ──────────────────────────────────────────────────────────────────
