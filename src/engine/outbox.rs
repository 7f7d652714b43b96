// ── Viking Bridge: Outbox ──────────────────────────────────────────────────
//
// Durable, ordered, at-least-once delivery of event batches to the store,
// built to survive intermittent store outages and process crashes.
//
// Backing state is a single append-oriented file, one JSON record per line,
// one file per agent. The file is the authoritative queue: on-disk order
// equals enqueue order, a partial trailing line is dropped as corruption
// without losing earlier items, and an item is removed only after the sender
// reports success. Persist rewrites the whole file through a temp + rename
// so readers of the next flush cycle see either the old or the new contents.
//
// Flush is single-flight. One item's failure delays only that item until its
// backoff window elapses; later items still flush.

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{OutboxConfig, SessionEvent};
use crate::engine::client::VikingStore;

// ── Item & sender ──────────────────────────────────────────────────────────

/// One queued batch. Field names stay camelCase on disk to match the file
/// format the host already owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub session_key: String,
    /// Store session id, denormalized at enqueue time.
    pub session_id: String,
    pub events: Vec<SessionEvent>,
}

/// Delivery seam. Production sends over the store client; tests substitute
/// scripted senders.
#[async_trait]
pub trait OutboxSender: Send + Sync {
    async fn send(&self, item: &OutboxItem) -> EngineResult<()>;
}

/// The production sender: one events-batch call per item.
pub struct StoreSender<S: VikingStore + ?Sized> {
    store: Arc<S>,
}

impl<S: VikingStore + ?Sized> StoreSender<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: VikingStore + ?Sized> OutboxSender for StoreSender<S> {
    async fn send(&self, item: &OutboxItem) -> EngineResult<()> {
        self.store.add_events_batch(&item.session_id, &item.events).await?;
        Ok(())
    }
}

// ── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStats {
    pub depth: usize,
    pub oldest_age_ms: i64,
    pub ready_now: usize,
    /// Milliseconds until the next queued item becomes ready; absent when
    /// the queue is empty or something is ready right now.
    pub next_ready_in_ms: Option<i64>,
    pub last_flush_duration_ms: Option<u64>,
    pub last_flush_sent: usize,
    pub last_flush_errors: usize,
    pub total_enqueued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub last_error: Option<String>,
    pub max_attempts: u32,
}

#[derive(Debug, Default)]
struct StatsInner {
    last_flush_duration_ms: Option<u64>,
    last_flush_sent: usize,
    last_flush_errors: usize,
    total_enqueued: u64,
    total_sent: u64,
    total_failed: u64,
    last_error: Option<String>,
}

// ── Outbox ─────────────────────────────────────────────────────────────────

pub struct Outbox {
    path: PathBuf,
    flush_interval: Duration,
    max_batch_size: usize,
    retry_base_ms: u64,
    retry_max_ms: u64,
    sender: Arc<dyn OutboxSender>,
    /// In-memory mirror of the file; mutations persist before release.
    items: tokio::sync::Mutex<Vec<OutboxItem>>,
    /// Single-flight gate: at most one flush in progress.
    flush_gate: tokio::sync::Mutex<()>,
    stats: parking_lot::Mutex<StatsInner>,
    shutdown: watch::Sender<bool>,
    timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    pub fn new(path: impl AsRef<Path>, config: &OutboxConfig, sender: Arc<dyn OutboxSender>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            path: path.as_ref().to_path_buf(),
            flush_interval: Duration::from_millis(config.effective_flush_interval_ms()),
            max_batch_size: config.effective_max_batch_size(),
            retry_base_ms: config.effective_retry_base_ms(),
            retry_max_ms: config.effective_retry_max_ms(),
            sender,
            items: tokio::sync::Mutex::new(Vec::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            stats: parking_lot::Mutex::new(StatsInner::default()),
            shutdown,
            timer: parking_lot::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Load the file contents (skipping malformed lines) and begin the
    /// periodic flush timer.
    pub async fn start(self: Arc<Self>) -> EngineResult<()> {
        self.load().await?;

        let outbox = Arc::clone(&self);
        let mut rx = self.shutdown.subscribe();
        let interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                if let Err(e) = outbox.flush().await {
                    warn!("[outbox] periodic flush failed: {e}");
                }
            }
        });
        *self.timer.lock() = Some(handle);
        Ok(())
    }

    /// Cancel the flush timer. An in-flight flush completes; stop never
    /// interrupts a send that already owns durability.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ── Queue operations ───────────────────────────────────────────────────

    /// Append a batch and persist. Returns the new queue depth.
    /// Enqueue succeeds whenever the file write succeeds; delivery failures
    /// are observed only through stats and rising depth.
    pub async fn enqueue(
        &self,
        session_key: &str,
        session_id: &str,
        events: Vec<SessionEvent>,
    ) -> EngineResult<usize> {
        let now = now_ms();
        let item = OutboxItem {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            attempts: 0,
            next_attempt_at: now,
            session_key: session_key.to_string(),
            session_id: session_id.to_string(),
            events,
        };

        let mut items = self.items.lock().await;
        items.push(item);
        self.persist(&items).await?;
        let depth = items.len();
        drop(items);

        self.stats.lock().total_enqueued += 1;
        Ok(depth)
    }

    /// Drain ready items in enqueue order. At most `max_batch_size`
    /// successful sends per cycle; failures back the item off without
    /// blocking the ones behind it. Returns the number sent.
    pub async fn flush(&self) -> EngineResult<usize> {
        // Single-flight: a flush already in progress owns this cycle.
        let _gate = match self.flush_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return Ok(0),
        };

        let started = std::time::Instant::now();
        let now = now_ms();

        let ready: Vec<OutboxItem> = {
            let items = self.items.lock().await;
            items.iter().filter(|i| i.next_attempt_at <= now).cloned().collect()
        };

        if ready.is_empty() {
            return Ok(0);
        }

        let mut sent_ids: Vec<String> = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();

        for item in &ready {
            if sent_ids.len() >= self.max_batch_size {
                break;
            }
            match self.sender.send(item).await {
                Ok(()) => sent_ids.push(item.id.clone()),
                Err(e) => failures.push((item.id.clone(), e.to_string())),
            }
        }

        // Apply results against the live queue: remove successes, back off
        // failures. Concurrent enqueues appended while we were sending stay
        // untouched at the tail.
        {
            let mut items = self.items.lock().await;
            items.retain(|i| !sent_ids.contains(&i.id));
            for (id, _) in &failures {
                if let Some(item) = items.iter_mut().find(|i| &i.id == id) {
                    item.attempts += 1;
                    item.updated_at = now_ms();
                    item.next_attempt_at = now_ms() + self.backoff_ms(item.attempts) as i64;
                }
            }
            self.persist(&items).await?;
        }

        let sent = sent_ids.len();
        {
            let mut stats = self.stats.lock();
            stats.last_flush_duration_ms = Some(started.elapsed().as_millis() as u64);
            stats.last_flush_sent = sent;
            stats.last_flush_errors = failures.len();
            stats.total_sent += sent as u64;
            stats.total_failed += failures.len() as u64;
            if let Some((_, message)) = failures.last() {
                stats.last_error = Some(message.clone());
            }
        }

        if !failures.is_empty() {
            warn!("[outbox] flush: {} sent, {} failed (backing off)", sent, failures.len());
        } else if sent > 0 {
            info!("[outbox] flush: {sent} sent");
        }
        Ok(sent)
    }

    pub async fn depth(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn get_stats(&self) -> OutboxStats {
        let now = now_ms();
        let (depth, oldest_age_ms, ready_now, next_ready_in_ms, max_attempts) = {
            let items = self.items.lock().await;
            let depth = items.len();
            let oldest = items.iter().map(|i| now - i.created_at).max().unwrap_or(0);
            let ready = items.iter().filter(|i| i.next_attempt_at <= now).count();
            let next_ready = if ready > 0 || depth == 0 {
                None
            } else {
                items.iter().map(|i| i.next_attempt_at - now).min()
            };
            let max_attempts = items.iter().map(|i| i.attempts).max().unwrap_or(0);
            (depth, oldest, ready, next_ready, max_attempts)
        };

        let inner = self.stats.lock();
        OutboxStats {
            depth,
            oldest_age_ms,
            ready_now,
            next_ready_in_ms,
            last_flush_duration_ms: inner.last_flush_duration_ms,
            last_flush_sent: inner.last_flush_sent,
            last_flush_errors: inner.last_flush_errors,
            total_enqueued: inner.total_enqueued,
            total_sent: inner.total_sent,
            total_failed: inner.total_failed,
            last_error: inner.last_error.clone(),
            max_attempts,
        }
    }

    // ── Persistence ────────────────────────────────────────────────────────

    async fn load(&self) -> EngineResult<()> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut items = self.items.lock().await;
                items.clear();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Vec::new();
        let mut dropped = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<OutboxItem>(line) {
                Ok(item) => loaded.push(item),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!("[outbox] load: dropped {dropped} unparseable line(s) from {:?}", self.path);
        }
        info!("[outbox] loaded {} queued item(s) from {:?}", loaded.len(), self.path);

        let mut items = self.items.lock().await;
        *items = loaded;
        Ok(())
    }

    /// Rewrite the whole file atomically: serialize every item to its own
    /// line, write a temp file, rename over the original.
    async fn persist(&self, items: &[OutboxItem]) -> EngineResult<()> {
        let mut buffer = String::new();
        for item in items {
            buffer.push_str(&serde_json::to_string(item)?);
            buffer.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, buffer).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn backoff_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(20);
        self.retry_base_ms.saturating_mul(1u64 << exp).min(self.retry_max_ms)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{EventRole, SessionEvent};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sender whose health is flipped by tests; records delivery order.
    struct ScriptedSender {
        healthy: AtomicBool,
        delivered: parking_lot::Mutex<Vec<OutboxItem>>,
    }

    impl ScriptedSender {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                delivered: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn delivered_events(&self) -> usize {
            self.delivered.lock().iter().map(|i| i.events.len()).sum()
        }
    }

    #[async_trait]
    impl OutboxSender for ScriptedSender {
        async fn send(&self, item: &OutboxItem) -> EngineResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                self.delivered.lock().push(item.clone());
                Ok(())
            } else {
                Err(crate::atoms::error::EngineError::Transport("store down".into()))
            }
        }
    }

    fn test_config() -> OutboxConfig {
        OutboxConfig {
            enabled: true,
            path: None,
            flush_interval_ms: 20,
            max_batch_size: 16,
            retry_base_ms: 50,
            retry_max_ms: 400,
        }
    }

    fn message(n: usize) -> SessionEvent {
        let role = if n % 2 == 0 { EventRole::User } else { EventRole::Assistant };
        SessionEvent::message(role, format!("msg-{n}"))
    }

    #[tokio::test]
    async fn enqueue_persists_and_reports_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = ScriptedSender::new(true);
        let outbox = Outbox::new(&path, &test_config(), sender);

        let d1 = outbox.enqueue("agent:main", "s-1", vec![message(0)]).await.unwrap();
        let d2 = outbox.enqueue("agent:main", "s-1", vec![message(1)]).await.unwrap();
        assert_eq!((d1, d2), (1, 2));

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.lines().count(), 2);
    }

    #[tokio::test]
    async fn flush_delivers_in_enqueue_order_and_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = ScriptedSender::new(true);
        let outbox = Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>);

        for n in 0..5 {
            outbox.enqueue("agent:main", "s-1", vec![message(n)]).await.unwrap();
        }
        let sent = outbox.flush().await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(outbox.depth().await, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "");

        let delivered = sender.delivered.lock();
        let contents: Vec<String> = delivered
            .iter()
            .map(|i| match &i.events[0].body {
                crate::atoms::types::SessionEventBody::Message { content, .. } => content.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(contents, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn failed_items_back_off_and_are_not_retried_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = ScriptedSender::new(false);
        let outbox = Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>);

        outbox.enqueue("agent:main", "s-1", vec![message(0)]).await.unwrap();
        assert_eq!(outbox.flush().await.unwrap(), 0);

        let stats = outbox.get_stats().await;
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.max_attempts, 1);
        assert_eq!(stats.total_failed, 1);
        assert!(stats.last_error.as_deref().unwrap_or("").contains("store down"));

        // Item is backed off: an immediate second flush attempts nothing.
        sender.healthy.store(true, Ordering::SeqCst);
        assert_eq!(outbox.flush().await.unwrap(), 0);
        assert!(outbox.get_stats().await.next_ready_in_ms.unwrap_or(0) > 0);

        // After the backoff window it drains.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(outbox.flush().await.unwrap(), 1);
        assert_eq!(outbox.depth().await, 0);
    }

    #[tokio::test]
    async fn flush_caps_successful_sends_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let mut config = test_config();
        config.max_batch_size = 3;
        let sender = ScriptedSender::new(true);
        let outbox = Outbox::new(&path, &config, Arc::clone(&sender) as Arc<dyn OutboxSender>);

        for n in 0..7 {
            outbox.enqueue("agent:main", "s-1", vec![message(n)]).await.unwrap();
        }
        assert_eq!(outbox.flush().await.unwrap(), 3);
        assert_eq!(outbox.depth().await, 4);
        assert_eq!(outbox.flush().await.unwrap(), 3);
        assert_eq!(outbox.flush().await.unwrap(), 1);
        assert_eq!(outbox.depth().await, 0);
    }

    #[tokio::test]
    async fn one_failing_item_does_not_block_the_rest() {
        // A sender that refuses a specific batch but accepts the others.
        struct Picky {
            delivered: parking_lot::Mutex<Vec<String>>,
        }
        #[async_trait]
        impl OutboxSender for Picky {
            async fn send(&self, item: &OutboxItem) -> EngineResult<()> {
                if item.session_key == "poison" {
                    return Err(crate::atoms::error::EngineError::Transport("refused".into()));
                }
                self.delivered.lock().push(item.session_key.clone());
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = Arc::new(Picky { delivered: parking_lot::Mutex::new(Vec::new()) });
        let outbox = Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>);

        outbox.enqueue("ok-1", "s-1", vec![message(0)]).await.unwrap();
        outbox.enqueue("poison", "s-1", vec![message(1)]).await.unwrap();
        outbox.enqueue("ok-2", "s-1", vec![message(2)]).await.unwrap();

        assert_eq!(outbox.flush().await.unwrap(), 2);
        assert_eq!(outbox.depth().await, 1);
        assert_eq!(*sender.delivered.lock(), vec!["ok-1".to_string(), "ok-2".to_string()]);
    }

    #[tokio::test]
    async fn cold_restart_drains_previous_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");

        // First life: the sender always throws; stop with the item queued.
        {
            let sender = ScriptedSender::new(false);
            let outbox = Arc::new(Outbox::new(&path, &test_config(), sender));
            Arc::clone(&outbox).start().await.unwrap();
            outbox.enqueue("agent:main", "s-1", vec![message(0)]).await.unwrap();
            let _ = outbox.flush().await.unwrap();
            outbox.stop().await;
        }

        // Second life on the same file with a healthy sender.
        let sender = ScriptedSender::new(true);
        let outbox = Arc::new(Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>));
        Arc::clone(&outbox).start().await.unwrap();
        assert_eq!(outbox.depth().await, 1);

        // The reloaded item may still be in its backoff window.
        tokio::time::sleep(Duration::from_millis(60)).await;
        outbox.flush().await.unwrap();
        outbox.stop().await;

        assert_eq!(sender.delivered_events(), 1);
        assert_eq!(outbox.depth().await, 0);
    }

    #[tokio::test]
    async fn load_skips_blank_and_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");

        let sender = ScriptedSender::new(true);
        let seed = Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>);
        seed.enqueue("agent:main", "s-1", vec![message(0)]).await.unwrap();

        // Corrupt the file: blank line, garbage, and a partial record
        // (crash mid-append).
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("\nnot json at all\n{\"id\":\"truncat");
        std::fs::write(&path, raw).unwrap();

        let reloaded = Outbox::new(&path, &test_config(), sender);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.depth().await, 1);
    }

    #[tokio::test]
    async fn outage_and_recovery_delivers_every_event_exactly_as_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let mut config = test_config();
        config.max_batch_size = 50;
        config.retry_base_ms = 10;
        config.retry_max_ms = 20;
        let sender = ScriptedSender::new(false);
        let outbox = Outbox::new(&path, &config, Arc::clone(&sender) as Arc<dyn OutboxSender>);

        // Store is down: 200 alternating messages plus a session-end commit.
        for n in 0..200 {
            outbox.enqueue("agent:main", "s-1", vec![message(n)]).await.unwrap();
        }
        outbox
            .enqueue("agent:main", "s-1", vec![SessionEvent::commit("session_end")])
            .await
            .unwrap();
        assert!(outbox.depth().await >= 201);

        let _ = outbox.flush().await.unwrap();
        assert_eq!(sender.delivered_events(), 0);

        // Store comes back: drain within a bounded number of cycles.
        sender.healthy.store(true, Ordering::SeqCst);
        for _ in 0..40 {
            if outbox.depth().await == 0 {
                break;
            }
            outbox.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(outbox.depth().await, 0);
        assert_eq!(sender.delivered_events(), 201);
    }

    #[tokio::test]
    async fn periodic_timer_flushes_without_manual_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let sender = ScriptedSender::new(true);
        let outbox = Arc::new(Outbox::new(&path, &test_config(), Arc::clone(&sender) as Arc<dyn OutboxSender>));

        Arc::clone(&outbox).start().await.unwrap();
        outbox.enqueue("agent:main", "s-1", vec![message(0)]).await.unwrap();

        for _ in 0..50 {
            if outbox.depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        outbox.stop().await;

        assert_eq!(outbox.depth().await, 0);
        assert_eq!(sender.delivered_events(), 1);
    }
}
