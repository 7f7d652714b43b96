// Paw Agent Engine — OpenViking Memory Bridge
//
// Couples the agent runtime to a remote OpenViking memory store over HTTP.
// Two jobs:
//   read path  — inject relevant prior context into each agent turn
//                (search → plan → rank → relation expansion → layered snippets)
//   write path — durably capture message/tool/commit events into the store
//                (translate → outbox → batched delivery with retry)
//
// Module layout:
//   atoms/    — pure data: constants, error enum, event/config/wire types
//   engine/   — behavior: store client, outbox, session links, write bridge,
//               retrieval planner + pipeline, fs-write policy, diagnostics
//
// The host owns configuration loading, CLI wiring, log backend installation
// and the agent loop; this crate exposes the bridge surface only.

pub mod atoms;
pub mod engine;

// ── Curated re-exports ─────────────────────────────────────────────────────

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    CommitMode, ContextKind, ReadLayer, ResolvedMemoryConfig, SearchStrategy, SessionEvent,
    SessionEventBody,
};
pub use engine::backend::{BackendStatus, MemoryBackend, VikingMemoryBackend};
pub use engine::bridge::{BridgeRegistry, EnqueueOutcome, WriteBridge};
pub use engine::client::{VikingClient, VikingStore};
pub use engine::fs_policy::FsWritePolicy;
pub use engine::outbox::Outbox;
pub use engine::retrieval::{ReadFileResult, ReadPipeline, SearchOptions, SnippetResult};
pub use engine::session_link::SessionLinkRegistry;
