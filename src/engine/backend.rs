// ── Viking Bridge: Memory Backend ──────────────────────────────────────────
//
// The host supports multiple memory backends behind one retrieval surface;
// `MemoryBackend` is that surface and `VikingMemoryBackend` is the
// OpenViking variant, composed from the write bridge and the read pipeline.
//
// Availability probes lean on the store's observer endpoints: vector search
// is served by vikingdb, embeddings by the VLM pipeline.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::atoms::error::EngineResult;
use crate::atoms::types::ResolvedMemoryConfig;
use crate::engine::bridge::{BridgeRegistry, WriteBridge};
use crate::engine::diagnostics::{BridgeStats, LayeringSnapshot, RankingSnapshot};
use crate::engine::outbox::OutboxStats;
use crate::engine::retrieval::{ReadFileResult, ReadPipeline, SearchOptions, SnippetResult};
use crate::engine::session_link::SessionLinkRegistry;

// ── Trait ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions)
        -> EngineResult<Vec<SnippetResult>>;
    async fn read_file(
        &self,
        rel_path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> EngineResult<ReadFileResult>;
    async fn status(&self) -> BackendStatus;
    /// Push pending writes toward the store now instead of waiting for the
    /// flush timer.
    async fn sync(&self) -> EngineResult<()>;
    async fn probe_embedding_availability(&self) -> bool;
    async fn probe_vector_availability(&self) -> bool;
    async fn close(&self);
}

/// Host-facing health/activity snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub backend: String,
    pub endpoint: String,
    pub enabled: bool,
    pub bridge: BridgeStats,
    pub outbox: Option<OutboxStats>,
    pub last_ranking: Option<RankingSnapshot>,
    pub last_layering: Option<LayeringSnapshot>,
}

// ── OpenViking variant ─────────────────────────────────────────────────────

pub struct VikingMemoryBackend {
    agent_id: String,
    config: ResolvedMemoryConfig,
    bridge: Arc<WriteBridge>,
    pipeline: ReadPipeline,
}

impl VikingMemoryBackend {
    /// Compose a backend from an existing bridge (which owns the store
    /// client, session links, outbox and diagnostics).
    pub fn new(agent_id: impl Into<String>, config: ResolvedMemoryConfig, bridge: Arc<WriteBridge>) -> Self {
        let agent_id = agent_id.into();
        let pipeline = ReadPipeline::new(
            agent_id.clone(),
            config.clone(),
            bridge.store(),
            bridge.links(),
            bridge.diagnostics(),
        );
        Self { agent_id, config, bridge, pipeline }
    }

    /// Ensure the memoised bridge for (agentId, endpoint) and wrap it.
    pub async fn connect(
        agent_id: &str,
        config: &ResolvedMemoryConfig,
        registry: &BridgeRegistry,
        links: Arc<SessionLinkRegistry>,
    ) -> EngineResult<Self> {
        let bridge = registry.ensure(agent_id, config, links).await?;
        Ok(Self::new(agent_id, config.clone(), bridge))
    }

    pub fn bridge(&self) -> &Arc<WriteBridge> {
        &self.bridge
    }

    pub fn pipeline(&self) -> &ReadPipeline {
        &self.pipeline
    }
}

#[async_trait]
impl MemoryBackend for VikingMemoryBackend {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> EngineResult<Vec<SnippetResult>> {
        self.pipeline.search(query, options).await
    }

    async fn read_file(
        &self,
        rel_path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> EngineResult<ReadFileResult> {
        self.pipeline.read_file(rel_path, from, lines).await
    }

    async fn status(&self) -> BackendStatus {
        let diagnostics = self.bridge.diagnostics();
        let snapshot = diagnostics.snapshot(&self.agent_id, &self.config.endpoint);
        BackendStatus {
            backend: "openviking".into(),
            endpoint: self.config.endpoint.clone(),
            enabled: self.config.enabled,
            bridge: snapshot.bridge,
            outbox: self.bridge.outbox_stats().await,
            last_ranking: snapshot.last_ranking,
            last_layering: snapshot.last_layering,
        }
    }

    async fn sync(&self) -> EngineResult<()> {
        // Drain ready items until a cycle makes no progress; backed-off
        // items stay queued for their retry window.
        if let Some(outbox) = self.bridge.outbox() {
            loop {
                let sent = outbox.flush().await?;
                if sent == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn probe_embedding_availability(&self) -> bool {
        match self.bridge.store().observer_health("vlm").await {
            Ok(health) => health.is_healthy,
            Err(_) => false,
        }
    }

    async fn probe_vector_availability(&self) -> bool {
        match self.bridge.store().observer_health("vikingdb").await {
            Ok(health) => health.is_healthy,
            Err(_) => false,
        }
    }

    async fn close(&self) {
        self.bridge.shutdown().await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
