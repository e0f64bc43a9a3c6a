//! Save orchestrator: debounced, single-flight saves per document.
//!
//! Architecture:
//! ```text
//!  trigger(doc, content) ──► hash == last? ── yes ──► Unchanged
//!          │ no
//!          ▼
//!   Debouncing (Scheduler timer, re-armed on every trigger)
//!          │ fire / force_save
//!          ▼
//!   Saving ── compress ── create version ──┬─ offline ──────► OfflineQueue
//!    (one per document;                    ├─ batching ─────► BatchScheduler
//!     newer content is parked)             └─ direct ──┬────► Saved
//!                                                      ├────► conflict → OfflineQueue
//!                                                      └─ Retrying ─► fallback record
//! ```
//!
//! Every failure stops here: callers see a [`SaveOutcome`] and observers a
//! [`SaveState`], never an error.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (Timeouts and Unbounded Delays)

use log::{debug, error, info, warn};
use quire_core::{Document, DocumentId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchScheduler, ItemResolution};
use crate::codec::{CompressedPayload, CompressionCodec};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::item::{Priority, SavePayload, SyncQueueItem};
use crate::ledger::{ContentVersion, IncrementalData, LedgerConfig, VersionLedger, VersionStats};
use crate::listeners::{Listeners, SubscriptionId};
use crate::metrics::{Alert, MetricRecorder, Operation, PerformanceSample, SampleMetadata};
use crate::offline::{ConflictRecord, DrainReport, OfflineQueue, Resolution, ResolveStrategy};
use crate::retry::RetryPolicy;
use crate::runtime::{NetworkMonitor, Scheduler, TimerId};
use crate::services::{EngineDeps, Services};
use crate::storage::{decode_record, keys, FallbackRecord};
use crate::transport::{ConflictData, SaveRequest, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Quiet period before a triggered save runs (default: 2s)
    pub debounce_ms: u64,
    /// Route online saves through the batch scheduler
    pub enable_batching: bool,
    /// Priority of debounced saves; forced saves are `high`
    pub default_priority: Priority,
    pub session_id: String,
    pub author: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            enable_batching: false,
            default_priority: Priority::Medium,
            session_id: Uuid::new_v4().to_string(),
            author: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 100,
            session_id: "test-session".into(),
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Idle,
    Debouncing,
    Saving,
    Saved,
    Offline,
    Retrying { attempt: u32 },
    Failed,
    Conflict,
}

impl SaveStatus {
    /// Short user-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            SaveStatus::Idle => "Up to date",
            SaveStatus::Debouncing => "Unsaved changes",
            SaveStatus::Saving => "Saving",
            SaveStatus::Saved => "Saved",
            SaveStatus::Offline => "Offline, will retry",
            SaveStatus::Retrying { .. } => "Connection problem, retrying",
            SaveStatus::Failed => "Saved on this device only",
            SaveStatus::Conflict => "Conflict needs attention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    None,
    Resolved,
    Pending(usize),
}

/// Read model published to state listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveState {
    pub document_id: DocumentId,
    pub status: SaveStatus,
    pub version: u64,
    pub dirty: bool,
    pub last_saved_at_ms: Option<u64>,
    pub compression_ratio: f64,
    pub success_rate: f64,
    pub conflict: ConflictStatus,
    pub queued_items: usize,
    pub data_loss_count: u64,
    pub last_error: Option<String>,
}

impl SaveState {
    fn new(document_id: DocumentId, version: u64) -> Self {
        Self {
            document_id,
            status: SaveStatus::Idle,
            version,
            dirty: false,
            last_saved_at_ms: None,
            compression_ratio: 1.0,
            success_rate: 100.0,
            conflict: ConflictStatus::None,
            queued_items: 0,
            data_loss_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Same content as the last trigger
    Unchanged,
    /// Debounce timer (re)armed
    Armed,
    /// Content could not be serialized
    Invalid,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved {
        version: u64,
        server_version: Option<u64>,
    },
    /// Offline: waiting in the offline queue
    Queued { item_id: String, version: u64 },
    Batched { item_id: String, version: u64 },
    Conflict {
        conflict_id: String,
        resolution: Resolution,
    },
    /// Written to the local fallback record after the server path failed
    FellBack { version: u64, error: String },
    Unchanged,
    Failed { error: String },
}

impl SaveOutcome {
    /// The change reached the server or a durable queue.
    pub fn is_success(&self) -> bool {
        !matches!(self, SaveOutcome::FellBack { .. } | SaveOutcome::Failed { .. })
    }
}

/// Handle returned by the `on_*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    State(SubscriptionId),
    Metrics(SubscriptionId),
    Alert(SubscriptionId),
    Conflict(SubscriptionId),
}

// ─── Per-document slot ────────────────────────────────────────────────────

struct DocSlot {
    /// Hash of the most recently triggered content
    last_hash: Option<String>,
    /// Hash of the most recently versioned content
    saved_hash: Option<String>,
    pending: Option<Document>,
    timer: Option<TimerId>,
    timer_gen: u64,
    in_flight: bool,
    /// Content to save as soon as the in-flight save resolves
    parked: Option<(Document, Priority)>,
    ledger: VersionLedger,
    /// Last server version number, sent as the base of the next save
    base_version: Option<u64>,
    state: SaveState,
    last_outcome: Option<SaveOutcome>,
}

impl DocSlot {
    fn new(ledger: VersionLedger) -> Self {
        let state = SaveState::new(ledger.document_id(), ledger.current_version());
        Self {
            last_hash: ledger.latest().map(|v| v.content_hash.clone()),
            saved_hash: ledger.latest().map(|v| v.content_hash.clone()),
            pending: None,
            timer: None,
            timer_gen: 0,
            in_flight: false,
            parked: None,
            ledger,
            base_version: None,
            state,
            last_outcome: None,
        }
    }

    fn park(&mut self, content: Document, priority: Priority) {
        let priority = match &self.parked {
            Some((_, parked)) => priority.max(*parked),
            None => priority,
        };
        self.parked = Some((content, priority));
    }
}

/// A versioned, compressed payload ready for dispatch.
struct Prepared {
    payload: SavePayload,
    compressed: CompressedPayload,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────

struct Inner {
    config: OrchestratorConfig,
    ledger_config: LedgerConfig,
    auto_report: bool,
    scheduler: Arc<dyn Scheduler>,
    services: Services,
    offline: Arc<OfflineQueue>,
    batch: Arc<BatchScheduler>,
    slots: Mutex<HashMap<DocumentId, DocSlot>>,
    settled: Notify,
    state_listeners: Listeners<SaveState>,
    closed: AtomicBool,
}

/// Entry point of the engine. Cheap to clone.
#[derive(Clone)]
pub struct SaveOrchestrator {
    inner: Arc<Inner>,
}

impl SaveOrchestrator {
    /// Build the engine, starting online.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self::with_network(config, deps, Arc::new(NetworkMonitor::default()))
    }

    pub fn with_network(
        config: EngineConfig,
        deps: EngineDeps,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let services = Services::new(&deps, config.codec, config.metrics.clone(), network);
        let offline = OfflineQueue::new(config.offline, services.clone());
        let batch = BatchScheduler::new(config.batch, services.clone(), Some(Arc::clone(&offline)));

        let inner = Arc::new(Inner {
            config: config.orchestrator,
            ledger_config: config.ledger,
            auto_report: config.metrics.auto_report,
            scheduler: deps.scheduler,
            services,
            offline,
            batch,
            slots: Mutex::new(HashMap::new()),
            settled: Notify::new(),
            state_listeners: Listeners::new(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.batch.subscribe_outcomes(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_batch_outcome(outcome);
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.offline.subscribe_drains(move |report| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_drain(report);
            }
        });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.offline.subscribe_conflicts(move |record| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_conflict(record);
            }
        });

        Self { inner }
    }

    /// Start the offline watcher, the batch loop (if batching) and the
    /// metrics report loop (if configured). Requires a tokio runtime.
    pub fn start(&self) {
        self.inner.offline.start();
        if self.inner.config.enable_batching {
            self.inner.batch.start();
        }
        if self.inner.auto_report {
            self.inner.services.metrics.start_reporting();
        }
    }

    /// Record new content; saves after `debounce_ms` of quiet.
    pub fn trigger(&self, doc: DocumentId, content: Document) -> TriggerOutcome {
        let inner = &self.inner;
        if inner.is_closed() {
            return TriggerOutcome::Closed;
        }
        let hash = match inner.hash_of(&content) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("trigger for {doc} rejected: {e}");
                return TriggerOutcome::Invalid;
            }
        };
        {
            let mut slots = inner.lock_slots();
            let slot = inner.slot(&mut slots, doc);
            if slot.last_hash.as_deref() == Some(hash.as_str()) {
                return TriggerOutcome::Unchanged;
            }
            slot.last_hash = Some(hash);
            slot.pending = Some(content);
            slot.state.dirty = true;
            if !slot.in_flight {
                slot.state.status = SaveStatus::Debouncing;
            }
            inner.arm(doc, slot);
        }
        inner.publish(doc);
        TriggerOutcome::Armed
    }

    /// Cancel the debounce and save now. If a save is in flight the
    /// content is saved right after it and this call waits for that.
    pub async fn force_save(&self, doc: DocumentId, content: Document) -> SaveOutcome {
        let inner = &self.inner;
        if inner.is_closed() {
            return SaveOutcome::Failed {
                error: EngineError::Closed.to_string(),
            };
        }
        let hash = match inner.hash_of(&content) {
            Ok(hash) => hash,
            Err(e) => return SaveOutcome::Failed { error: e.to_string() },
        };

        enum Next {
            Run(Document),
            Wait,
            Unchanged,
        }
        let next = {
            let mut slots = inner.lock_slots();
            let slot = inner.slot(&mut slots, doc);
            if let Some(timer) = slot.timer.take() {
                inner.scheduler.cancel(timer);
            }
            slot.timer_gen += 1;
            let superseded = slot.pending.take().is_some();
            if !superseded
                && !slot.in_flight
                && slot.parked.is_none()
                && slot.saved_hash.as_deref() == Some(hash.as_str())
            {
                Next::Unchanged
            } else {
                slot.last_hash = Some(hash);
                slot.state.dirty = true;
                if slot.in_flight {
                    slot.park(content, Priority::High);
                    Next::Wait
                } else {
                    slot.in_flight = true;
                    Next::Run(content)
                }
            }
        };

        match next {
            Next::Unchanged => SaveOutcome::Unchanged,
            Next::Run(content) => {
                let runner = Arc::clone(inner);
                // Own task: dropping this future must not strand the slot.
                let task =
                    tokio::spawn(async move { runner.run_saves(doc, content, Priority::High).await });
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => SaveOutcome::Failed {
                        error: format!("save task failed: {e}"),
                    },
                }
            }
            Next::Wait => {
                inner.settle(doc).await;
                inner
                    .lock_slots()
                    .get(&doc)
                    .and_then(|slot| slot.last_outcome.clone())
                    .unwrap_or(SaveOutcome::Unchanged)
            }
        }
    }

    /// Wait until no save is in flight for `doc`.
    pub async fn settle(&self, doc: DocumentId) {
        self.inner.settle(doc).await;
    }

    pub fn save_state(&self, doc: DocumentId) -> Option<SaveState> {
        self.inner.snapshot(doc)
    }

    /// Re-arm a save of a stored version's content. `None` if the version
    /// is not in the ledger.
    pub fn rollback(&self, doc: DocumentId, version: u64) -> Option<Document> {
        let content = {
            let mut slots = self.inner.lock_slots();
            self.inner.slot(&mut slots, doc).ledger.rollback_to_version(version)
        }?;
        info!("rolling {doc} back to v{version}");
        self.trigger(doc, content.clone());
        Some(content)
    }

    /// Versions after `from` (exclusive) up to `to` (exclusive, `None`
    /// for the latest inclusive).
    pub fn incremental_since(&self, doc: DocumentId, from: u64, to: Option<u64>) -> IncrementalData {
        let mut slots = self.inner.lock_slots();
        self.inner
            .slot(&mut slots, doc)
            .ledger
            .get_incremental_data(from, to)
    }

    /// Newest first.
    pub fn history(&self, doc: DocumentId, limit: usize) -> Vec<Arc<ContentVersion>> {
        let mut slots = self.inner.lock_slots();
        self.inner.slot(&mut slots, doc).ledger.history(limit)
    }

    pub fn version_stats(&self, doc: DocumentId) -> VersionStats {
        let mut slots = self.inner.lock_slots();
        self.inner.slot(&mut slots, doc).ledger.stats()
    }

    /// Drive reachability. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.services.network.set_online(online);
        if changed {
            info!("network {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Read and verify the local fallback record of `doc`.
    pub fn recover_fallback(&self, doc: DocumentId) -> Result<Option<Document>, EngineError> {
        let services = &self.inner.services;
        let started = Instant::now();
        let Some(record) = services.backup.read_fallback(doc)? else {
            return Ok(None);
        };
        let decoded = services
            .codec
            .decompress(
                &record.compressed_payload,
                record.compression.algorithm,
                &record.content_hash,
            )
            .map_err(EngineError::from)
            .and_then(|bytes| Ok(Document::from_json(&bytes)?));

        services.metrics.record(
            Operation::Load,
            elapsed_ms(started),
            decoded.is_ok(),
            SampleMetadata {
                data_size: Some(record.compression.original_size),
                compression_ratio: Some(record.compression.ratio),
                error: decoded.as_ref().err().map(|e| e.to_string()),
                ..SampleMetadata::default()
            },
        );
        if let Err(e) = &decoded {
            error!("fallback record for {doc} rejected: {e}");
        }
        decoded.map(Some)
    }

    /// Settle a conflict and, when online, deliver the chosen content.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolveStrategy,
        merged: Option<Document>,
    ) -> Result<ConflictRecord, EngineError> {
        let record = self
            .inner
            .offline
            .resolve_conflict(conflict_id, strategy, merged)?;
        if self.inner.services.network.is_online() {
            self.inner.offline.drain().await;
        }
        Ok(record)
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.offline.conflicts()
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn on_state_change(
        &self,
        listener: impl Fn(&SaveState) + Send + Sync + 'static,
    ) -> Subscription {
        Subscription::State(self.inner.state_listeners.subscribe(listener))
    }

    pub fn on_metrics(
        &self,
        listener: impl Fn(&PerformanceSample) + Send + Sync + 'static,
    ) -> Subscription {
        Subscription::Metrics(self.inner.services.metrics.subscribe_samples(listener))
    }

    pub fn on_alert(&self, listener: impl Fn(&Alert) + Send + Sync + 'static) -> Subscription {
        Subscription::Alert(self.inner.services.metrics.subscribe_alerts(listener))
    }

    pub fn on_conflict(
        &self,
        listener: impl Fn(&ConflictRecord) + Send + Sync + 'static,
    ) -> Subscription {
        Subscription::Conflict(self.inner.offline.subscribe_conflicts(listener))
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        match subscription {
            Subscription::State(id) => self.inner.state_listeners.unsubscribe(id),
            Subscription::Metrics(id) => self.inner.services.metrics.unsubscribe_samples(id),
            Subscription::Alert(id) => self.inner.services.metrics.unsubscribe_alerts(id),
            Subscription::Conflict(id) => self.inner.offline.unsubscribe_conflicts(id),
        }
    }

    // ─── Components ───────────────────────────────────────────────────

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        &self.inner.offline
    }

    pub fn batch(&self) -> &Arc<BatchScheduler> {
        &self.inner.batch
    }

    pub fn metrics(&self) -> &Arc<MetricRecorder> {
        &self.inner.services.metrics
    }

    pub fn codec(&self) -> &Arc<CompressionCodec> {
        &self.inner.services.codec
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.inner.services.network
    }

    /// Cancel timers, move debounced content into the offline queue,
    /// stop background loops, persist and drop listeners. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<(DocumentId, Document)> = {
            let mut slots = inner.lock_slots();
            slots
                .iter_mut()
                .filter_map(|(doc, slot)| {
                    if let Some(timer) = slot.timer.take() {
                        inner.scheduler.cancel(timer);
                    }
                    slot.timer_gen += 1;
                    slot.pending.take().map(|content| (*doc, content))
                })
                .collect()
        };
        for (doc, content) in pending {
            let queued = inner
                .prepare(doc, &content)
                .and_then(|prepared| {
                    inner
                        .offline
                        .enqueue(prepared.payload, inner.config.default_priority)
                });
            match queued {
                Ok(item_id) => info!("unsaved changes of {doc} queued as {item_id}"),
                Err(e) => error!("unsaved changes of {doc} could not be queued: {e}"),
            }
        }

        inner.offline.close();
        inner.batch.close();
        inner.services.metrics.close();
        inner.state_listeners.clear();
        inner.settled.notify_waiters();
        info!("save orchestrator closed");
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<DocumentId, DocSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn hash_of(&self, content: &Document) -> Result<String, EngineError> {
        Ok(self.services.codec.hash(&content.to_canonical_json()?))
    }

    /// The slot of `doc`, restoring its ledger on first use.
    fn slot<'a>(
        &self,
        slots: &'a mut HashMap<DocumentId, DocSlot>,
        doc: DocumentId,
    ) -> &'a mut DocSlot {
        slots.entry(doc).or_insert_with(|| {
            let ledger =
                VersionLedger::restore(doc, &self.ledger_config, self.services.store.as_ref())
                    .unwrap_or_else(|e| {
                        let next = self.version_floor(doc);
                        error!("version history of {doc} unreadable, resuming at v{next}: {e}");
                        VersionLedger::resume(doc, &self.ledger_config, next)
                    });
            DocSlot::new(ledger)
        })
    }

    /// First version number not yet used for `doc`, recovered from what
    /// the store still holds besides the ledger snapshot. Reads the store
    /// directly so it is safe under the slots lock.
    fn version_floor(&self, doc: DocumentId) -> u64 {
        let store = self.services.store.as_ref();
        let counter = VersionLedger::stored_next_version(doc, store)
            .unwrap_or_else(|e| {
                warn!("version counter of {doc} unreadable: {e}");
                None
            })
            .unwrap_or(1);

        let queued = [keys::OFFLINE_QUEUE, keys::BATCH_QUEUE]
            .into_iter()
            .filter_map(|key| store.get(key).ok().flatten())
            .filter_map(|bytes| decode_record::<Vec<SyncQueueItem>>(&bytes).ok())
            .flatten()
            .filter(|item| item.document_id == doc)
            .map(|item| item.payload.version);
        let fallback = self
            .services
            .backup
            .read_fallback(doc)
            .ok()
            .flatten()
            .map(|record| record.version);
        let preserved = self
            .services
            .backup
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|record| record.item.document_id == doc)
            .map(|record| record.item.payload.version);

        queued
            .chain(fallback)
            .chain(preserved)
            .map(|version| version + 1)
            .fold(counter, u64::max)
    }

    fn update(&self, doc: DocumentId, f: impl FnOnce(&mut DocSlot)) {
        {
            let mut slots = self.lock_slots();
            f(self.slot(&mut slots, doc));
        }
        self.publish(doc);
    }

    fn set_status(&self, doc: DocumentId, status: SaveStatus) {
        self.update(doc, |slot| slot.state.status = status);
    }

    // ─── Debounce ─────────────────────────────────────────────────────

    fn arm(self: &Arc<Self>, doc: DocumentId, slot: &mut DocSlot) {
        if let Some(timer) = slot.timer.take() {
            self.scheduler.cancel(timer);
        }
        slot.timer_gen += 1;
        let generation = slot.timer_gen;
        let weak = Arc::downgrade(self);
        slot.timer = Some(self.scheduler.arm(
            Duration::from_millis(self.config.debounce_ms),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(doc, generation);
                }
            }),
        ));
    }

    fn fire(self: &Arc<Self>, doc: DocumentId, generation: u64) {
        if self.is_closed() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            error!("debounce for {doc} fired outside a tokio runtime, save deferred");
            return;
        };
        let content = {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(&doc) else {
                return;
            };
            if slot.timer_gen != generation {
                return;
            }
            slot.timer = None;
            let Some(content) = slot.pending.take() else {
                return;
            };
            if slot.in_flight {
                slot.park(content, self.config.default_priority);
                return;
            }
            slot.in_flight = true;
            content
        };
        let inner = Arc::clone(self);
        let priority = self.config.default_priority;
        handle.spawn(async move {
            inner.run_saves(doc, content, priority).await;
        });
    }

    /// Save `content`, then anything parked meanwhile. The caller has
    /// claimed the slot (`in_flight = true`).
    async fn run_saves(
        self: &Arc<Self>,
        doc: DocumentId,
        content: Document,
        priority: Priority,
    ) -> SaveOutcome {
        let mut next = (content, priority);
        loop {
            let outcome = self.perform_save(doc, next.0, next.1).await;
            let parked = {
                let mut slots = self.lock_slots();
                let slot = self.slot(&mut slots, doc);
                slot.last_outcome = Some(outcome.clone());
                let mut parked = slot.parked.take();
                // Triggered while in flight: save now instead of waiting out the timer.
                if parked.is_none() {
                    if let Some(content) = slot.pending.take() {
                        if let Some(timer) = slot.timer.take() {
                            self.scheduler.cancel(timer);
                        }
                        slot.timer_gen += 1;
                        parked = Some((content, self.config.default_priority));
                    }
                }
                if parked.is_none() {
                    slot.in_flight = false;
                }
                parked
            };
            match parked {
                Some(parked) => next = parked,
                None => {
                    self.settled.notify_waiters();
                    return outcome;
                }
            }
        }
    }

    async fn settle(&self, doc: DocumentId) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = self
                .lock_slots()
                .get(&doc)
                .is_some_and(|slot| slot.in_flight);
            if !busy || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    // ─── Save pipeline ────────────────────────────────────────────────

    /// Compress and record a new version.
    fn prepare(&self, doc: DocumentId, content: &Document) -> Result<Prepared, EngineError> {
        let bytes = content.to_canonical_json()?;
        let started = Instant::now();
        let compressed = self.services.codec.compress(&bytes);
        self.services.metrics.record(
            Operation::Compress,
            elapsed_ms(started),
            true,
            SampleMetadata {
                data_size: Some(bytes.len()),
                compression_ratio: Some(compressed.ratio),
                ..SampleMetadata::default()
            },
        );

        let now = self.services.clock.now_ms();
        let mut slots = self.lock_slots();
        let slot = self.slot(&mut slots, doc);
        let version = slot.ledger.create_version(
            content,
            &self.config.session_id,
            self.config.author.as_deref(),
            Some(compressed.ratio),
            now,
        )?;
        if let Err(e) = slot.ledger.persist(self.services.store.as_ref()) {
            error!("persisting version history of {doc} failed: {e}");
        }
        slot.saved_hash = Some(version.content_hash.clone());
        slot.state.version = version.version;
        slot.state.compression_ratio = compressed.ratio;

        let payload = SavePayload::new(
            doc,
            version.version,
            slot.base_version,
            self.config.session_id.clone(),
            compressed.clone(),
        );
        Ok(Prepared {
            payload,
            compressed,
        })
    }

    async fn perform_save(
        self: &Arc<Self>,
        doc: DocumentId,
        content: Document,
        priority: Priority,
    ) -> SaveOutcome {
        let started = Instant::now();
        self.update(doc, |slot| {
            slot.state.status = SaveStatus::Saving;
            slot.state.last_error = None;
        });

        let outcome = match self.prepare(doc, &content) {
            Ok(prepared) => self.dispatch(doc, prepared, priority).await,
            Err(e) => {
                error!("save of {doc} could not be prepared: {e}");
                self.update(doc, |slot| {
                    slot.state.status = SaveStatus::Failed;
                    slot.state.last_error = Some("The content could not be encoded".into());
                });
                SaveOutcome::Failed { error: e.to_string() }
            }
        };

        self.services.metrics.record(
            Operation::Save,
            elapsed_ms(started),
            outcome.is_success(),
            SampleMetadata {
                network: Some(self.services.network.status()),
                error: match &outcome {
                    SaveOutcome::FellBack { error, .. } | SaveOutcome::Failed { error } => {
                        Some(error.clone())
                    }
                    _ => None,
                },
                ..SampleMetadata::default()
            },
        );
        self.publish(doc);
        outcome
    }

    async fn dispatch(
        self: &Arc<Self>,
        doc: DocumentId,
        prepared: Prepared,
        priority: Priority,
    ) -> SaveOutcome {
        if !self.services.network.is_online() {
            return self.queue_offline(doc, prepared, priority);
        }
        if self.config.enable_batching {
            let version = prepared.payload.version;
            return match self.batch.enqueue(prepared.payload.clone(), priority, Vec::new()) {
                Ok(item_id) => {
                    debug!("{doc} v{version} handed to batch scheduler as {item_id}");
                    SaveOutcome::Batched { item_id, version }
                }
                Err(e) => {
                    warn!("batch queue rejected {doc} v{version}: {e}");
                    self.fall_back(doc, &prepared, e, 0)
                }
            };
        }
        self.send_direct(doc, prepared, priority).await
    }

    fn queue_offline(&self, doc: DocumentId, prepared: Prepared, priority: Priority) -> SaveOutcome {
        let version = prepared.payload.version;
        match self.offline.enqueue(prepared.payload.clone(), priority) {
            Ok(item_id) => {
                self.set_status(doc, SaveStatus::Offline);
                SaveOutcome::Queued { item_id, version }
            }
            Err(e) => self.fall_back(doc, &prepared, e, 0),
        }
    }

    /// Direct call with exponential backoff; falls back locally when
    /// retries run out.
    async fn send_direct(
        self: &Arc<Self>,
        doc: DocumentId,
        prepared: Prepared,
        priority: Priority,
    ) -> SaveOutcome {
        let policy = &self.config.retry;
        let mut retries = 0u32;
        loop {
            let request = SaveRequest::from_payload(&prepared.payload, None, priority);
            let started = Instant::now();
            let result = self.services.transport.send(&request).await;
            let elapsed = elapsed_ms(started);

            let error: EngineError = match result {
                Ok(response) if !response.conflict_detected => {
                    self.record_sync(&prepared, elapsed, retries, None);
                    let version = prepared.payload.version;
                    self.mark_saved(doc, version, response.server_version_number);
                    if let Err(e) = self.services.backup.clear_fallback(doc) {
                        warn!("clearing fallback record of {doc} failed: {e}");
                    }
                    return SaveOutcome::Saved {
                        version,
                        server_version: response.server_version_number,
                    };
                }
                Ok(response) => match response.conflict_data {
                    Some(data) => {
                        self.record_sync(&prepared, elapsed, retries, None);
                        return self
                            .route_conflict(doc, prepared, data, response.server_version_number, priority)
                            .await;
                    }
                    None => TransportError::Permanent {
                        status: None,
                        message: "conflict reported without server data".into(),
                    }
                    .into(),
                },
                Err(e) => e.into(),
            };
            self.record_sync(&prepared, elapsed, retries, Some(error.to_string()));

            if !(error.is_retryable() && policy.allows_retry(retries)) {
                return self.fall_back(doc, &prepared, error, retries);
            }
            retries += 1;
            if !self.services.network.is_online() {
                info!("network lost while saving {doc}, queueing");
                return self.queue_offline(doc, prepared, priority);
            }
            warn!(
                "save of {doc} v{} failed ({error}), retry {retries}/{}",
                prepared.payload.version, policy.max_retries
            );
            self.set_status(doc, SaveStatus::Retrying { attempt: retries });
            tokio::time::sleep(policy.delay_for(retries)).await;
            if !self.services.network.is_online() {
                return self.queue_offline(doc, prepared, priority);
            }
        }
    }

    fn record_sync(&self, prepared: &Prepared, elapsed: f64, retries: u32, error: Option<String>) {
        self.services.metrics.record(
            Operation::Sync,
            elapsed,
            error.is_none(),
            SampleMetadata {
                data_size: Some(prepared.payload.byte_size()),
                compression_ratio: Some(prepared.compressed.ratio),
                retry_count: Some(retries),
                network: Some(self.services.network.status()),
                error,
                ..SampleMetadata::default()
            },
        );
    }

    /// Hand a stale-base save to the offline queue's conflict path; an
    /// auto-merged result is delivered right away.
    async fn route_conflict(
        self: &Arc<Self>,
        doc: DocumentId,
        prepared: Prepared,
        data: ConflictData,
        server_version: Option<u64>,
        priority: Priority,
    ) -> SaveOutcome {
        let now = self.services.clock.now_ms();
        let item = SyncQueueItem::new(
            prepared.payload.clone(),
            priority,
            self.config.retry.max_retries,
            now,
        );
        let record = match self.offline.accept_conflict(item, data, server_version) {
            Ok(record) => record,
            Err(e) => return self.fall_back(doc, &prepared, e, 0),
        };

        if !record.is_pending() {
            let report = self.offline.drain().await;
            let delivered = report.delivered.iter().any(|d| d.item_id == record.item_id);
            if !delivered {
                self.set_status(doc, SaveStatus::Offline);
            }
        }
        SaveOutcome::Conflict {
            conflict_id: record.conflict_id,
            resolution: record.resolution,
        }
    }

    /// Terminal failure of the server path: keep the content locally and
    /// tell the user.
    fn fall_back(
        &self,
        doc: DocumentId,
        prepared: &Prepared,
        cause: EngineError,
        retries: u32,
    ) -> SaveOutcome {
        let version = prepared.payload.version;
        let record = FallbackRecord::new(
            doc,
            version,
            &prepared.compressed,
            self.services.clock.now_ms(),
        );
        let written = self.services.backup.write_fallback(&record);

        error!("save of {doc} v{version} failed after {retries} retries: {cause}");
        self.services.metrics.raise_critical(
            Operation::Save,
            format!("Changes to document {doc} could not be saved to the server"),
            retries as f64,
            Some(match &written {
                Ok(()) => "Your changes are kept on this device and can be recovered".to_string(),
                Err(_) => "Local fallback failed; copy your changes before closing".to_string(),
            }),
        );
        self.update(doc, |slot| {
            slot.state.status = SaveStatus::Failed;
            slot.state.last_error = Some(if written.is_ok() {
                "Could not reach the server; your changes are kept on this device".into()
            } else {
                "Could not save your changes".into()
            });
        });

        match written {
            Ok(()) => SaveOutcome::FellBack {
                version,
                error: cause.to_string(),
            },
            Err(e) => SaveOutcome::Failed {
                error: format!("{cause}; fallback write failed: {e}"),
            },
        }
    }

    // ─── Feedback from the queues ─────────────────────────────────────

    /// The server accepted `version` of `doc`.
    fn mark_saved(&self, doc: DocumentId, version: u64, server_version: Option<u64>) {
        let now = self.services.clock.now_ms();
        self.update(doc, |slot| {
            slot.ledger.mark_synced(version);
            if let Err(e) = slot.ledger.persist(self.services.store.as_ref()) {
                error!("persisting version history of {doc} failed: {e}");
            }
            if server_version.is_some() {
                slot.base_version = server_version;
            }
            if version < slot.ledger.current_version() {
                return;
            }
            slot.state.last_saved_at_ms = Some(now);
            slot.state.last_error = None;
            if slot.pending.is_some() {
                slot.state.status = SaveStatus::Debouncing;
            } else {
                slot.state.status = SaveStatus::Saved;
                slot.state.dirty = false;
            }
        });
    }

    fn mark_lost(&self, doc: DocumentId) {
        self.update(doc, |slot| {
            slot.state.status = SaveStatus::Failed;
            slot.state.last_error =
                Some("Could not reach the server; the change is kept in the local backup".into());
        });
    }

    fn apply_batch_outcome(&self, outcome: &BatchOutcome) {
        for result in &outcome.items {
            let doc = result.document_id;
            match &result.resolution {
                ItemResolution::Synced { server_version } => {
                    self.mark_saved(doc, result.version, *server_version)
                }
                ItemResolution::Retrying { attempt } => {
                    let attempt = *attempt;
                    let version = result.version;
                    self.update(doc, |slot| {
                        if version >= slot.ledger.current_version() {
                            slot.state.status = SaveStatus::Retrying { attempt };
                        }
                    });
                }
                ItemResolution::Escalated | ItemResolution::Dropped { .. } => {
                    self.mark_lost(doc)
                }
                // The conflict listener updates the slot.
                ItemResolution::Conflict => {}
            }
        }
    }

    fn apply_drain(&self, report: &DrainReport) {
        for delivered in &report.delivered {
            self.mark_saved(
                delivered.document_id,
                delivered.version,
                delivered.server_version,
            );
        }
        for doc in &report.escalated_documents {
            self.mark_lost(*doc);
        }
    }

    fn apply_conflict(&self, record: &ConflictRecord) {
        let online = self.services.network.is_online();
        self.update(record.document_id, |slot| {
            if record.is_pending() {
                slot.state.status = SaveStatus::Conflict;
            } else if slot.state.status == SaveStatus::Conflict {
                slot.state.status = if online {
                    SaveStatus::Saving
                } else {
                    SaveStatus::Offline
                };
            }
        });
    }

    // ─── Read model ───────────────────────────────────────────────────

    fn snapshot(&self, doc: DocumentId) -> Option<SaveState> {
        let mut state = self.lock_slots().get(&doc)?.state.clone();

        let conflicts = self.offline.conflicts_for(doc);
        let pending = conflicts.iter().filter(|c| c.is_pending()).count();
        state.conflict = if pending > 0 {
            ConflictStatus::Pending(pending)
        } else if conflicts.is_empty() {
            ConflictStatus::None
        } else {
            ConflictStatus::Resolved
        };
        state.queued_items = self
            .offline
            .items()
            .iter()
            .chain(self.batch.items().iter())
            .filter(|item| item.document_id == doc)
            .count();
        state.data_loss_count = self.batch.data_loss_count() + self.offline.data_loss_count();
        state.success_rate = self
            .services
            .metrics
            .operation_stats(Operation::Save)
            .success_rate;
        Some(state)
    }

    fn publish(&self, doc: DocumentId) {
        if let Some(state) = self.snapshot(doc) {
            self.state_listeners.emit(&state);
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualClock, ManualScheduler};
    use crate::storage::MemoryStore;
    use crate::transport::{SaveResponse, ScriptedTransport};
    use quire_core::DocumentType;

    struct Harness {
        engine: SaveOrchestrator,
        scheduler: Arc<ManualScheduler>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let transport = Arc::new(ScriptedTransport::new());
        let deps = EngineDeps {
            clock,
            scheduler: scheduler.clone(),
            store: Arc::new(MemoryStore::new()),
            transport: transport.clone(),
        };
        Harness {
            engine: SaveOrchestrator::new(EngineConfig::for_testing(), deps),
            scheduler,
            transport,
        }
    }

    fn text(body: &str) -> Document {
        Document::text(DocumentType::RichText, body)
    }

    #[tokio::test]
    async fn test_identical_trigger_is_noop() {
        let h = harness();
        let doc = DocumentId::new();
        assert_eq!(h.engine.trigger(doc, text("a")), TriggerOutcome::Armed);
        assert_eq!(h.engine.trigger(doc, text("a")), TriggerOutcome::Unchanged);
        assert_eq!(h.scheduler.pending(), 1);
        assert_eq!(h.engine.save_state(doc).unwrap().status, SaveStatus::Debouncing);
    }

    #[tokio::test]
    async fn test_timer_fire_saves_and_publishes() {
        let h = harness();
        let doc = DocumentId::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        h.engine
            .on_state_change(move |s| seen.lock().unwrap().push(s.status));

        h.engine.trigger(doc, text("hello"));
        assert_eq!(h.scheduler.advance(Duration::from_millis(99)), 0);
        assert_eq!(h.scheduler.advance(Duration::from_millis(1)), 1);
        h.engine.settle(doc).await;

        let state = h.engine.save_state(doc).unwrap();
        assert_eq!(state.status, SaveStatus::Saved);
        assert_eq!(state.version, 1);
        assert!(!state.dirty);
        assert_eq!(h.transport.request_count(), 1);

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.first(), Some(&SaveStatus::Debouncing));
        assert!(statuses.contains(&SaveStatus::Saving));
        assert_eq!(statuses.last(), Some(&SaveStatus::Saved));
    }

    #[tokio::test]
    async fn test_force_save_cancels_timer() {
        let h = harness();
        let doc = DocumentId::new();
        h.engine.trigger(doc, text("draft"));
        let outcome = h.engine.force_save(doc, text("final")).await;
        assert!(matches!(outcome, SaveOutcome::Saved { version: 1, .. }));

        assert_eq!(h.scheduler.advance(Duration::from_secs(1)), 0);
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(h.engine.force_save(doc, text("final")).await, SaveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_base_version_follows_server() {
        let h = harness();
        let doc = DocumentId::new();
        h.transport.push(Ok(SaveResponse::accepted(41)));
        h.engine.force_save(doc, text("one")).await;
        h.engine.force_save(doc, text("two")).await;

        let requests = h.transport.requests();
        assert_eq!(requests[0].base_version, None);
        assert_eq!(requests[1].base_version, Some(41));
        assert_eq!(requests[1].version, 2);
        assert_eq!(h.engine.version_stats(doc).last_synced_version, 2);
    }

    #[tokio::test]
    async fn test_offline_save_is_queued() {
        let h = harness();
        let doc = DocumentId::new();
        h.engine.set_online(false);
        let outcome = h.engine.force_save(doc, text("offline edit")).await;
        assert!(matches!(outcome, SaveOutcome::Queued { version: 1, .. }));

        let state = h.engine.save_state(doc).unwrap();
        assert_eq!(state.status, SaveStatus::Offline);
        assert_eq!(state.queued_items, 1);
        assert_eq!(state.status.label(), "Offline, will retry");
        assert_eq!(h.transport.request_count(), 0);

        h.engine.set_online(true);
        h.engine.offline().drain().await;
        let state = h.engine.save_state(doc).unwrap();
        assert_eq!(state.status, SaveStatus::Saved);
        assert_eq!(state.queued_items, 0);
    }

    #[tokio::test]
    async fn test_rollback_rearms_old_content() {
        let h = harness();
        let doc = DocumentId::new();
        h.engine.force_save(doc, text("v1")).await;
        h.engine.force_save(doc, text("v2")).await;

        let restored = h.engine.rollback(doc, 1).unwrap();
        assert_eq!(restored, text("v1"));
        assert_eq!(h.scheduler.advance(Duration::from_millis(100)), 1);
        h.engine.settle(doc).await;
        assert_eq!(h.engine.save_state(doc).unwrap().version, 3);
        assert!(h.engine.rollback(doc, 99).is_none());

        let incremental = h.engine.incremental_since(doc, 1, None);
        let numbers: Vec<u64> = incremental.versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_close_queues_debounced_content() {
        let h = harness();
        let doc = DocumentId::new();
        h.engine.trigger(doc, text("unsaved"));
        h.engine.close();

        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.engine.offline().len(), 1);
        assert_eq!(h.engine.trigger(doc, text("late")), TriggerOutcome::Closed);
        assert!(matches!(
            h.engine.force_save(doc, text("late")).await,
            SaveOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_trigger_during_flight_saves_after_it() {
        let h = harness();
        let doc = DocumentId::new();
        h.engine.trigger(doc, text("A"));
        assert_eq!(h.scheduler.advance(Duration::from_millis(100)), 1);

        // A is claimed but not yet sent.
        assert_eq!(h.engine.trigger(doc, text("B")), TriggerOutcome::Armed);
        h.engine.settle(doc).await;

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        let b_hash = h.engine.codec().hash(&text("B").to_canonical_json().unwrap());
        assert_eq!(requests[1].content_hash, b_hash);
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.engine.save_state(doc).unwrap().status, SaveStatus::Saved);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let h = harness();
        let sub = h.engine.on_alert(|_| {});
        assert!(h.engine.unsubscribe(sub));
        assert!(!h.engine.unsubscribe(sub));
    }
}
