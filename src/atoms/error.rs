// ── Paw Atoms: Error Types ─────────────────────────────────────────────────
// Single canonical error enum for the bridge, built with `thiserror`.
//
// Design rules:
//   • Variants follow the failure taxonomy: transport failures are the only
//     retriable class; everything else surfaces or degrades.
//   • The `#[from]` attribute wires std/external error conversions.
//   • `EngineError` → `String` is provided via `Display` so host command
//     boundaries (`Result<T, String>`) can convert without boilerplate.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer). Retriable.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Store reported a transport-level failure (5xx, timeout). Retriable.
    #[error("Store transport error: {0}")]
    Transport(String),

    /// Store answered outside its envelope contract (non-JSON body, 2xx with
    /// status != ok, missing fields). Not retriable.
    #[error("Store protocol error: {0}")]
    Protocol(String),

    /// An fs-write policy rule fired. Surfaced verbatim, never retried.
    #[error("{0}")]
    Policy(String),

    /// Bridge or backend configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller-supplied input failed validation (empty query, bad role, …).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether the outbox should back off and retry this failure.
    /// Only network/transport failures qualify; protocol, policy, config and
    /// validation failures will not succeed on a second attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Network(_) | EngineError::Transport(_))
    }

    /// Create a policy error with the standard denial prefix.
    pub fn fs_denied(rule: impl std::fmt::Display) -> Self {
        EngineError::Policy(format!("fs write denied: {rule}"))
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All bridge operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────
// Lets host command functions call `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
