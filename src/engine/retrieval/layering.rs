// ── Viking Bridge: Layered Snippet Assembly ────────────────────────────────
//
// Resolves each selected candidate to a text snippet at one of the store's
// content fidelity tiers (l0 abstract, l1 overview, l2 full read) and packs
// the results under the per-snippet and whole-injection character budgets.
//
// Inline fields from the search hit are preferred over extra HTTP calls;
// a transport failure on any tier degrades to the next tier instead of
// failing the retrieval.

use log::debug;

use crate::atoms::types::{CandidateOrigin, RankedCandidate, ReadLayer};
use crate::engine::client::VikingStore;
use crate::engine::diagnostics::LayeringSnapshot;

// ── Output ─────────────────────────────────────────────────────────────────

/// One row fit for injection into the agent's prompt.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetResult {
    /// Store uri of the backing content.
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f64,
    pub snippet: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedLayer {
    L0,
    L1,
    L2,
}

pub(crate) struct AssemblyOutput {
    pub results: Vec<SnippetResult>,
    pub layering: LayeringSnapshot,
    pub dropped_by_budget: usize,
    pub skipped_empty_snippet: usize,
}

// ── Assembly ───────────────────────────────────────────────────────────────

pub(crate) async fn assemble_snippets(
    store: &dyn VikingStore,
    selected: &[RankedCandidate],
    read_layer: ReadLayer,
    max_snippet_chars: usize,
    max_injected_chars: usize,
    relation_expansion_enabled: bool,
) -> AssemblyOutput {
    let mut results = Vec::new();
    let mut layering = LayeringSnapshot {
        requested_layer: layer_name(read_layer).to_string(),
        ..Default::default()
    };
    let mut dropped_by_budget = 0usize;
    let mut skipped_empty = 0usize;
    let mut remaining_chars = max_injected_chars as i64;

    for (index, candidate) in selected.iter().enumerate() {
        let (text, layer) = resolve_snippet(store, candidate, read_layer, max_snippet_chars).await;

        let mut snippet = trim_chars(text.trim(), max_snippet_chars);
        if relation_expansion_enabled && !snippet.is_empty() {
            let prefix = match candidate.origin {
                CandidateOrigin::Relation => format!(
                    "[relation-expanded d{} from {}] ",
                    candidate.relation_depth,
                    candidate.relation_from.as_deref().unwrap_or("?")
                ),
                CandidateOrigin::Direct => "[direct-hit] ".to_string(),
            };
            snippet = trim_chars(&format!("{prefix}{snippet}"), max_snippet_chars);
        }

        if snippet.is_empty() {
            skipped_empty += 1;
            continue;
        }

        if remaining_chars <= 0 {
            layering.truncated_by_budget = true;
            dropped_by_budget = selected.len() - index;
            break;
        }

        let pre_budget_len = snippet.chars().count();
        if pre_budget_len as i64 > remaining_chars {
            snippet = trim_with_ellipsis(&snippet, remaining_chars as usize);
            if snippet.is_empty() {
                layering.truncated_by_budget = true;
                dropped_by_budget = selected.len() - index;
                break;
            }
        }

        let emitted_len = snippet.chars().count();
        remaining_chars -= emitted_len as i64;
        layering.injected_chars += emitted_len;
        layering.snippet_chars += pre_budget_len;
        match layer {
            ResolvedLayer::L0 => layering.l0_count += 1,
            ResolvedLayer::L1 => layering.l1_count += 1,
            ResolvedLayer::L2 => layering.l2_count += 1,
        }

        results.push(SnippetResult {
            path: candidate.context.uri.clone(),
            start_line: 1,
            end_line: 1,
            score: candidate.score,
            snippet,
            source: "openviking".to_string(),
        });
    }

    layering.entries = results.len();
    AssemblyOutput { results, layering, dropped_by_budget, skipped_empty_snippet: skipped_empty }
}

// ── Layer resolution ───────────────────────────────────────────────────────

/// Fetch-once cache over the three content tiers of one candidate.
struct LayerFetcher<'a> {
    store: &'a dyn VikingStore,
    candidate: &'a RankedCandidate,
    l0: Option<String>,
    l1: Option<String>,
    l2: Option<String>,
}

impl<'a> LayerFetcher<'a> {
    fn new(store: &'a dyn VikingStore, candidate: &'a RankedCandidate) -> Self {
        Self { store, candidate, l0: None, l1: None, l2: None }
    }

    /// l0: inline abstract, store abstract, then the match reason.
    async fn l0(&mut self) -> String {
        if let Some(cached) = &self.l0 {
            return cached.clone();
        }
        let hit = &self.candidate.context;
        let mut text = hit.abstract_text.clone().unwrap_or_default();
        if text.trim().is_empty() {
            text = self.store.abstract_of(&hit.uri).await.unwrap_or_default();
        }
        if text.trim().is_empty() {
            text = hit.match_reason.clone().unwrap_or_default();
        }
        self.l0 = Some(text.clone());
        text
    }

    /// l1: inline overview, then the store's overview.
    async fn l1(&mut self) -> String {
        if let Some(cached) = &self.l1 {
            return cached.clone();
        }
        let hit = &self.candidate.context;
        let mut text = hit.overview.clone().unwrap_or_default();
        if text.trim().is_empty() {
            text = self.store.overview_of(&hit.uri).await.unwrap_or_default();
        }
        self.l1 = Some(text.clone());
        text
    }

    /// l2: always a store read.
    async fn l2(&mut self) -> String {
        if let Some(cached) = &self.l2 {
            return cached.clone();
        }
        let text = self.store.read_content(&self.candidate.context.uri).await.unwrap_or_default();
        self.l2 = Some(text.clone());
        text
    }
}

async fn resolve_snippet(
    store: &dyn VikingStore,
    candidate: &RankedCandidate,
    read_layer: ReadLayer,
    max_snippet_chars: usize,
) -> (String, ResolvedLayer) {
    let mut fetch = LayerFetcher::new(store, candidate);

    let ladder: &[ResolvedLayer] = match read_layer {
        ReadLayer::L2 => &[ResolvedLayer::L2, ResolvedLayer::L1, ResolvedLayer::L0],
        ReadLayer::L1 => &[ResolvedLayer::L1, ResolvedLayer::L0, ResolvedLayer::L2],
        ReadLayer::L0 => &[ResolvedLayer::L0, ResolvedLayer::L1, ResolvedLayer::L2],
        ReadLayer::Progressive => {
            return resolve_progressive(&mut fetch, max_snippet_chars).await;
        }
    };

    for layer in ladder {
        let text = match layer {
            ResolvedLayer::L0 => fetch.l0().await,
            ResolvedLayer::L1 => fetch.l1().await,
            ResolvedLayer::L2 => fetch.l2().await,
        };
        if !text.trim().is_empty() {
            return (text, *layer);
        }
    }
    debug!("[retrieval] no content at any layer for {}", candidate.context.uri);
    (String::new(), ResolvedLayer::L0)
}

/// Progressive: the overview when it is substantial, else a substantial
/// abstract, else the full read, else the longest non-empty of l1/l0.
async fn resolve_progressive(
    fetch: &mut LayerFetcher<'_>,
    max_snippet_chars: usize,
) -> (String, ResolvedLayer) {
    let threshold = (max_snippet_chars / 6).max(40);

    let overview = fetch.l1().await;
    if overview.trim().chars().count() >= threshold {
        return (overview, ResolvedLayer::L1);
    }
    let abstract_text = fetch.l0().await;
    if abstract_text.trim().chars().count() >= threshold {
        return (abstract_text, ResolvedLayer::L0);
    }
    let full = fetch.l2().await;
    if !full.trim().is_empty() {
        return (full, ResolvedLayer::L2);
    }

    let overview_len = overview.trim().chars().count();
    let abstract_len = abstract_text.trim().chars().count();
    if overview_len >= abstract_len && overview_len > 0 {
        (overview, ResolvedLayer::L1)
    } else if abstract_len > 0 {
        (abstract_text, ResolvedLayer::L0)
    } else {
        (String::new(), ResolvedLayer::L0)
    }
}

// ── Char-budget helpers ────────────────────────────────────────────────────

fn trim_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Trim to `max_chars`, spending the last three on an ellipsis when there is
/// room for one.
fn trim_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars >= 4 {
        let cut: String = text.chars().take(max_chars - 3).collect();
        format!("{cut}...")
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn layer_name(layer: ReadLayer) -> &'static str {
    match layer {
        ReadLayer::L0 => "l0",
        ReadLayer::L1 => "l1",
        ReadLayer::L2 => "l2",
        ReadLayer::Progressive => "progressive",
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
