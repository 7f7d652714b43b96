// ── Paw Atoms: Constants ───────────────────────────────────────────────────
// All named defaults for the bridge live here.
// Rationale: collecting constants in one place eliminates magic numbers and
// keeps the config fallback rules auditable: every zero-or-negative config
// value falls back to the default named below.

// ── Store client ───────────────────────────────────────────────────────────

/// Per-request timeout when the config does not supply one.
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;

// ── Write path ─────────────────────────────────────────────────────────────

/// Hard cap on event content. Longer content is truncated and marked.
pub const MAX_EVENT_CONTENT_BYTES: usize = 16_000;

/// Literal suffix appended when event content is truncated.
pub const TRUNCATION_MARKER: &str = "\n\n[truncated]";

/// Commit cadence: enqueue a periodic commit every N queued messages.
pub const DEFAULT_COMMIT_EVERY_N_MESSAGES: i64 = 24;

/// Commit cadence: enqueue a periodic commit when the last one is older
/// than N minutes (only once a first commit exists to measure from).
pub const DEFAULT_COMMIT_EVERY_N_MINUTES: i64 = 12;

// ── Outbox ─────────────────────────────────────────────────────────────────

pub const DEFAULT_OUTBOX_FLUSH_INTERVAL_MS: i64 = 2_000;
pub const DEFAULT_OUTBOX_MAX_BATCH_SIZE: i64 = 16;
pub const DEFAULT_OUTBOX_RETRY_BASE_MS: i64 = 1_000;
pub const DEFAULT_OUTBOX_RETRY_MAX_MS: i64 = 60_000;

// ── Read path ──────────────────────────────────────────────────────────────

/// Search result limit when the config does not supply one.
pub const DEFAULT_SEARCH_LIMIT: i64 = 10;

/// Maximum candidates that survive ranking.
pub const DEFAULT_MAX_ENTRIES: i64 = 6;

/// Per-snippet character cap.
pub const DEFAULT_MAX_SNIPPET_CHARS: i64 = 560;

/// Total injected character budget per search.
pub const DEFAULT_MAX_INJECTED_CHARS: i64 = 3_200;

/// Search root when the config does not supply a target uri.
pub const DEFAULT_TARGET_URI: &str = "viking://";

/// Uri scheme every store path lives under.
pub const VIKING_SCHEME: &str = "viking://";

/// Root for bare relative paths handed to `read_file`.
pub const RESOURCE_URI_ROOT: &str = "viking://resource/";

// ── Relation expansion ─────────────────────────────────────────────────────

pub const DEFAULT_RELATION_MAX_DEPTH: i64 = 2;
pub const DEFAULT_RELATION_MAX_ANCHORS: i64 = 4;
pub const DEFAULT_RELATION_MAX_EXPANDED_ENTRIES: i64 = 6;
pub const DEFAULT_RELATION_SEED_ANCHOR_SCORE: f64 = 0.35;
pub const DEFAULT_RELATION_PRIORITY_DEPTH_BONUS: i64 = 1;
pub const DEFAULT_RELATION_PRIORITY_ANCHORS_BONUS: i64 = 2;
pub const DEFAULT_RELATION_PRIORITY_EXPANDED_BONUS: i64 = 4;

/// Score decay per relation hop.
pub const RELATION_DEPTH_SCORE_DECAY: f64 = 0.12;

/// Flat score penalty for any relation-origin candidate.
pub const RELATION_SCORE_PENALTY: f64 = 0.08;

/// Flat rank penalty for any relation-origin candidate.
pub const RELATION_RANK_PENALTY: f64 = 0.25;

/// Rank decay per relation hop.
pub const RELATION_DEPTH_RANK_DECAY: f64 = 0.05;

// ── Ranking bonuses ────────────────────────────────────────────────────────

/// Rank bonus when a candidate's kind matches the planner priority.
pub const PRIORITY_MATCH_BONUS: f64 = 0.15;

/// Rank bonus for memory candidates when they are not the priority.
pub const MEMORY_BASE_BONUS: f64 = 0.05;
