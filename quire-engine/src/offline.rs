//! Offline queue with prioritized replay and conflict handling.
//!
//! Architecture:
//! ```text
//!  enqueue(payload, priority)          NetworkMonitor (watch<bool>)
//!          │                                   │ offline → online
//!          ▼                                   ▼
//! ┌──────────────────────────────┐     ┌───────────────┐
//! │ items (critical > ... > low, │ ◄── │ drain()       │ single flight
//! │        oldest first)         │     └──────┬────────┘
//! │ persisted: queue/offline     │            │ SaveTransport
//! └──────────────────────────────┘            ▼
//!                          ┌──── ok ──────► removed
//!                          ├──── conflict ► ConflictRecord + three-way merge
//!                          └──── error ───► retry with backoff │ emergency backup
//! ```
//!
//! Conflict records live alongside the queue (`queue/conflicts`) and are
//! never dropped while pending. An item waiting on a pending conflict keeps
//! status `conflict` and is skipped by drains until resolved.
//!
//! Versions of one document are delivered oldest first: a newer version
//! waits while an older one is backing off or was just retried.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Multi-Leader Replication)

use log::{debug, error, info, warn};
use quire_core::{
    three_way_merge, Document, DocumentId, FieldCollisionPolicy, FieldConflict, MergeOutcome,
    Tombstone,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::EngineError;
use crate::item::{
    eviction_candidate, order_for_delivery, queue_order, ItemStatus, Priority, SavePayload,
    SyncQueueItem,
};
use crate::listeners::{Listeners, SubscriptionId};
use crate::metrics::{Operation, SampleMetadata};
use crate::retry::RetryPolicy;
use crate::runtime::NetworkStatus;
use crate::services::Services;
use crate::storage::{decode_json, decode_record, encode_json, encode_record, keys, BackupReason};
use crate::transport::{ConflictData, SaveRequest, TransportError};

/// Drain passes per call; merged conflicts become ready within the same call.
const MAX_DRAIN_PASSES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Queue capacity (default: 100)
    pub max_queue_size: usize,
    /// Periodic drain interval while online (default: 5s)
    pub sync_interval_ms: u64,
    /// Attempt a three-way merge when the server reports a stale base
    pub enable_auto_merge: bool,
    pub collision_policy: FieldCollisionPolicy,
    pub retry: RetryPolicy,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            sync_interval_ms: 5000,
            enable_auto_merge: true,
            collision_policy: FieldCollisionPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OfflineConfig {
    pub fn for_testing() -> Self {
        Self {
            max_queue_size: 10,
            sync_interval_ms: 100,
            retry: RetryPolicy::for_testing(),
            ..Self::default()
        }
    }
}

/// How a conflict was (or will be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    Auto,
    Manual,
    ServerWins,
    ClientWins,
    Merge,
}

/// Explicit resolution requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveStrategy {
    ServerWins,
    ClientWins,
    Merge,
}

impl From<ResolveStrategy> for ConflictStrategy {
    fn from(strategy: ResolveStrategy) -> Self {
        match strategy {
            ResolveStrategy::ServerWins => ConflictStrategy::ServerWins,
            ResolveStrategy::ClientWins => ConflictStrategy::ClientWins,
            ResolveStrategy::Merge => ConflictStrategy::Merge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub item_id: String,
    pub document_id: DocumentId,
    pub session_id: String,
    pub client_version_number: u64,
    pub server_version_number: Option<u64>,
    pub base_version: Option<Document>,
    pub server_version: Document,
    pub client_version: Document,
    pub strategy: ConflictStrategy,
    pub merged_result: Option<Document>,
    pub field_conflicts: Vec<FieldConflict>,
    pub tombstones: Vec<Tombstone>,
    pub resolution: Resolution,
    pub created_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
}

impl ConflictRecord {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineMetrics {
    pub total_items: usize,
    pub pending_items: usize,
    pub conflict_items: usize,
    pub synced_items: u64,
    pub failed_attempts: u64,
    pub escalated_items: u64,
    /// Escalated after exhausting retries and backed up
    pub data_loss_count: u64,
    pub evicted_items: u64,
    pub pending_conflicts: usize,
    pub average_sync_ms: f64,
    pub offline_duration_ms: u64,
    pub network: NetworkStatus,
    pub last_sync_ms: Option<u64>,
}

/// What one call to [`OfflineQueue::drain`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Offline or another drain was running
    pub skipped: bool,
    pub attempted: usize,
    pub synced: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub escalated: usize,
    /// Item ids in send order
    pub sent: Vec<String>,
    pub delivered: Vec<Delivered>,
    /// Documents whose item went to the emergency backup
    pub escalated_documents: Vec<DocumentId>,
}

/// An item the server accepted during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub item_id: String,
    pub document_id: DocumentId,
    pub version: u64,
    pub server_version: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    items: Vec<SyncQueueItem>,
    conflicts: Vec<ConflictRecord>,
    synced: u64,
    failed_attempts: u64,
    escalated: u64,
    data_loss: u64,
    evicted: u64,
    sync_time_total_ms: f64,
    offline_since_ms: Option<u64>,
    offline_total_ms: u64,
    last_sync_ms: Option<u64>,
}

impl QueueState {
    fn item_mut(&mut self, id: &str) -> Option<&mut SyncQueueItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|i| i.id == id)
    }

    fn take_item(&mut self, id: &str) -> Option<SyncQueueItem> {
        let index = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(index))
    }
}

/// Clears the single-flight flag even if a drain future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    config: OfflineConfig,
    services: Services,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    conflict_listeners: Listeners<ConflictRecord>,
    drain_listeners: Listeners<DrainReport>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineQueue {
    /// Create the queue, restoring persisted items and conflicts.
    pub fn new(config: OfflineConfig, services: Services) -> Arc<Self> {
        let queue = Arc::new(Self {
            config,
            services,
            state: Mutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
            conflict_listeners: Listeners::new(),
            drain_listeners: Listeners::new(),
            watcher: Mutex::new(None),
        });
        queue.restore();
        queue
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restore(&self) {
        let store = &self.services.store;
        let items: Vec<SyncQueueItem> = match store.get(keys::OFFLINE_QUEUE) {
            Ok(Some(bytes)) => decode_record(&bytes).unwrap_or_else(|e| {
                error!("offline queue snapshot unreadable, starting empty: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("offline queue restore failed: {e}");
                Vec::new()
            }
        };
        let conflicts: Vec<ConflictRecord> = match store.get(keys::CONFLICTS) {
            Ok(Some(bytes)) => decode_json(&bytes).unwrap_or_else(|e| {
                error!("conflict records unreadable: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("conflict restore failed: {e}");
                Vec::new()
            }
        };

        let mut state = self.lock();
        state.items = items
            .into_iter()
            .map(|mut item| {
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                }
                item
            })
            .collect();
        state.items.sort_by(queue_order);
        state.conflicts = conflicts;
        if !state.items.is_empty() {
            info!("restored {} offline item(s)", state.items.len());
        }
    }

    /// Write items and conflicts. Failures are logged, never propagated.
    fn persist(&self) {
        let (items, conflicts) = {
            let state = self.lock();
            (state.items.clone(), state.conflicts.clone())
        };
        let store = &self.services.store;
        match encode_record(&items) {
            Ok(bytes) => {
                if let Err(e) = store.set(keys::OFFLINE_QUEUE, &bytes) {
                    error!("persisting offline queue failed: {e}");
                }
            }
            Err(e) => error!("encoding offline queue failed: {e}"),
        }
        match encode_json(&conflicts) {
            Ok(bytes) => {
                if let Err(e) = store.set(keys::CONFLICTS, &bytes) {
                    error!("persisting conflict records failed: {e}");
                }
            }
            Err(e) => error!("encoding conflict records failed: {e}"),
        }
    }

    // ─── Enqueue ──────────────────────────────────────────────────────

    /// Queue a save for later delivery. Returns the item id.
    pub fn enqueue(&self, payload: SavePayload, priority: Priority) -> Result<String, EngineError> {
        let now = self.services.clock.now_ms();
        let item = SyncQueueItem::new(payload, priority, self.config.retry.max_retries, now);
        let id = item.id.clone();
        self.admit(item)?;
        debug!("queued {id} ({}) for offline delivery", priority.as_str());
        self.persist();
        Ok(id)
    }

    /// Insert keeping capacity: evict the oldest lowest-priority item that
    /// is not waiting on a conflict.
    fn admit(&self, item: SyncQueueItem) -> Result<(), EngineError> {
        let evicted = {
            let mut state = self.lock();
            let mut evicted = None;
            if state.items.len() >= self.config.max_queue_size {
                let victim = eviction_candidate(&state.items, |i| i.status != ItemStatus::Conflict)
                    .filter(|&index| state.items[index].priority <= item.priority);
                match victim {
                    Some(index) => {
                        evicted = Some(state.items.remove(index));
                        state.evicted += 1;
                    }
                    None => {
                        return Err(EngineError::QueueOverflow {
                            capacity: self.config.max_queue_size,
                        })
                    }
                }
            }
            state.items.push(item);
            state.items.sort_by(queue_order);
            evicted
        };
        if let Some(victim) = evicted {
            warn!(
                "offline queue full, evicting {} ({})",
                victim.id,
                victim.priority.as_str()
            );
            if !self
                .services
                .preserve(Operation::Sync, &victim, BackupReason::QueueOverflow)
            {
                error!("evicted item {} is not in the emergency backup", victim.id);
            }
        }
        Ok(())
    }

    // ─── Drain ────────────────────────────────────────────────────────

    /// Send every ready item in priority order. Never overlaps itself.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.services.network.is_online() {
            report.skipped = true;
            return report;
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already in progress");
            report.skipped = true;
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        for _ in 0..MAX_DRAIN_PASSES {
            let batch = self.claim_ready();
            if batch.is_empty() {
                break;
            }
            // Documents whose item is still queued after its attempt.
            let mut held = HashSet::new();
            for item in batch {
                if !self.services.network.is_online() || held.contains(&item.document_id) {
                    self.release(&item.id);
                    continue;
                }
                let (id, doc) = (item.id.clone(), item.document_id);
                self.deliver(item, &mut report).await;
                if self.lock().contains(&id) {
                    held.insert(doc);
                }
            }
        }

        self.persist();
        if report.attempted > 0 {
            info!(
                "offline drain: {} sent, {} synced, {} conflict(s), {} retried, {} escalated",
                report.attempted, report.synced, report.conflicts, report.retried, report.escalated
            );
            self.drain_listeners.emit(&report);
        }
        report
    }

    /// Mark ready items as processing and return them in drain order.
    /// Nothing newer is claimed for a document whose oldest version is
    /// still backing off.
    fn claim_ready(&self) -> Vec<SyncQueueItem> {
        let now = self.services.clock.now_ms();
        let mut state = self.lock();
        order_for_delivery(&mut state.items);
        let mut waiting = HashSet::new();
        let mut claimed = Vec::new();
        for item in state.items.iter_mut() {
            if item.status == ItemStatus::Conflict {
                continue;
            }
            if !item.is_ready(now) {
                waiting.insert(item.document_id);
                continue;
            }
            if waiting.contains(&item.document_id) {
                continue;
            }
            item.status = ItemStatus::Processing;
            claimed.push(item.clone());
        }
        claimed
    }

    fn release(&self, id: &str) {
        if let Some(item) = self.lock().item_mut(id) {
            item.status = ItemStatus::Pending;
        }
    }

    async fn deliver(&self, item: SyncQueueItem, report: &mut DrainReport) {
        report.attempted += 1;
        report.sent.push(item.id.clone());

        let request = SaveRequest::from_payload(&item.payload, Some(&item.id), item.priority);
        let started = Instant::now();
        let result = self.services.transport.send(&request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(response) if response.conflict_detected => match response.conflict_data {
                Some(data) => {
                    report.conflicts += 1;
                    self.record_sync(elapsed_ms, true, &item, Some("stale_base"), None);
                    {
                        let mut state = self.lock();
                        if let Some(queued) = state.item_mut(&item.id) {
                            queued.status = ItemStatus::Conflict;
                        }
                    }
                    if let Err(e) =
                        self.open_conflict(&item, data, response.server_version_number)
                    {
                        self.escalate(&item.id, &e, report);
                    }
                }
                None => {
                    let err: EngineError = TransportError::Permanent {
                        status: None,
                        message: "conflict reported without server data".into(),
                    }
                    .into();
                    self.on_failure(&item, err, elapsed_ms, report);
                }
            },
            Ok(response) => {
                let now = self.services.clock.now_ms();
                {
                    let mut state = self.lock();
                    state.take_item(&item.id);
                    state.synced += 1;
                    state.sync_time_total_ms += elapsed_ms;
                    state.last_sync_ms = Some(now);
                }
                report.synced += 1;
                report.delivered.push(Delivered {
                    item_id: item.id.clone(),
                    document_id: item.document_id,
                    version: item.payload.version,
                    server_version: response.server_version_number,
                });
                self.record_sync(elapsed_ms, true, &item, None, None);
            }
            Err(e) => self.on_failure(&item, e.into(), elapsed_ms, report),
        }
    }

    fn on_failure(
        &self,
        item: &SyncQueueItem,
        err: EngineError,
        elapsed_ms: f64,
        report: &mut DrainReport,
    ) {
        self.record_sync(elapsed_ms, false, item, None, Some(err.to_string()));
        let retry = err.is_retryable() && self.config.retry.allows_retry(item.retry_count);
        if retry {
            let now = self.services.clock.now_ms();
            let mut state = self.lock();
            state.failed_attempts += 1;
            if let Some(queued) = state.item_mut(&item.id) {
                queued.retry_count += 1;
                queued.status = ItemStatus::Pending;
                queued.last_error = Some(err.to_string());
                queued.not_before_ms =
                    now + self.config.retry.delay_for(queued.retry_count).as_millis() as u64;
                debug!(
                    "item {} retry {}/{} after: {err}",
                    queued.id, queued.retry_count, queued.max_retries
                );
            }
            report.retried += 1;
        } else {
            self.lock().failed_attempts += 1;
            self.escalate(&item.id, &err, report);
        }
    }

    /// Terminal failure: move the item to the emergency backup. Only an
    /// item that exhausted its retries counts as data loss.
    fn escalate(&self, id: &str, err: &EngineError, report: &mut DrainReport) {
        let taken = self.lock().take_item(id);
        let Some(mut item) = taken else {
            return;
        };
        item.status = ItemStatus::Failed;
        item.last_error = Some(err.to_string());
        self.lock().escalated += 1;
        report.escalated += 1;
        report.escalated_documents.push(item.document_id);

        let reason = if err.is_retryable() {
            BackupReason::MaxRetriesExceeded
        } else {
            BackupReason::Rejected
        };
        if !self.services.preserve(Operation::Sync, &item, reason) {
            error!("item {} left the offline queue without a backup: {err}", item.id);
            return;
        }

        let message = if reason == BackupReason::MaxRetriesExceeded {
            let failure = EngineError::MaxRetriesExceeded {
                item_id: item.id.clone(),
                retries: item.retry_count,
            };
            let lost = {
                let mut state = self.lock();
                state.data_loss += 1;
                state.data_loss
            };
            let loss = EngineError::DataLoss {
                item_id: item.id.clone(),
            };
            error!("{failure}: {err}");
            error!("{loss} (total lost: {lost})");
            format!(
                "Save for document {} failed after {} retries",
                item.document_id, item.retry_count
            )
        } else {
            error!("item {} rejected: {err}", item.id);
            format!(
                "Save for document {} was not accepted ({err})",
                item.document_id
            )
        };
        self.services.metrics.raise_critical(
            Operation::Sync,
            message,
            item.retry_count as f64,
            Some("The change is kept in the local emergency backup".to_string()),
        );
    }

    fn record_sync(
        &self,
        elapsed_ms: f64,
        success: bool,
        item: &SyncQueueItem,
        conflict_type: Option<&str>,
        error: Option<String>,
    ) {
        self.services.metrics.record(
            Operation::Sync,
            elapsed_ms,
            success,
            SampleMetadata {
                data_size: Some(item.byte_size()),
                compression_ratio: Some(item.payload.ratio),
                retry_count: Some(item.retry_count),
                network: Some(self.services.network.status()),
                conflict_type: conflict_type.map(str::to_string),
                error,
            },
        );
    }

    // ─── Conflicts ────────────────────────────────────────────────────

    /// Take ownership of an item the server rejected as stale (from the
    /// direct save path or a batch) and open a conflict for it.
    pub fn accept_conflict(
        &self,
        mut item: SyncQueueItem,
        data: ConflictData,
        server_version_number: Option<u64>,
    ) -> Result<ConflictRecord, EngineError> {
        item.status = ItemStatus::Conflict;
        let snapshot = item.clone();
        if let Err(e) = self.admit(item) {
            error!("conflicted item {} has no room in the offline queue: {e}", snapshot.id);
            if self
                .services
                .preserve(Operation::Sync, &snapshot, BackupReason::QueueOverflow)
            {
                self.services.metrics.raise_critical(
                    Operation::Sync,
                    format!(
                        "Conflicting save for document {} could not be queued",
                        snapshot.document_id
                    ),
                    snapshot.retry_count as f64,
                    Some("The change is kept in the local emergency backup".to_string()),
                );
            }
            return Err(e);
        }
        let record = match self.open_conflict(&snapshot, data, server_version_number) {
            Ok(record) => record,
            Err(e) => {
                let mut report = DrainReport::default();
                self.escalate(&snapshot.id, &e, &mut report);
                self.persist();
                return Err(e);
            }
        };
        self.persist();
        Ok(record)
    }

    fn open_conflict(
        &self,
        item: &SyncQueueItem,
        data: ConflictData,
        server_version_number: Option<u64>,
    ) -> Result<ConflictRecord, EngineError> {
        let started = Instant::now();
        let client = item.payload.decode_document(&self.services.codec)?;
        let now = self.services.clock.now_ms();

        let mut record = ConflictRecord {
            conflict_id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            document_id: item.document_id,
            session_id: item.payload.session_id.clone(),
            client_version_number: item.payload.version,
            server_version_number,
            base_version: data.base_version,
            server_version: data.server_version,
            client_version: client,
            strategy: ConflictStrategy::Manual,
            merged_result: None,
            field_conflicts: Vec::new(),
            tombstones: Vec::new(),
            resolution: Resolution::Pending,
            created_at_ms: now,
            resolved_at_ms: None,
        };

        if self.config.enable_auto_merge {
            record.strategy = ConflictStrategy::Auto;
            match three_way_merge(
                record.base_version.as_ref(),
                &record.server_version,
                &record.client_version,
                self.config.collision_policy,
            ) {
                Ok(MergeOutcome::Merged {
                    document,
                    tombstones,
                }) => {
                    record.tombstones = tombstones;
                    record.merged_result = Some(document.clone());
                    record.resolution = Resolution::Resolved;
                    record.resolved_at_ms = Some(now);
                    self.requeue_with(&record, &document)?;
                }
                Ok(MergeOutcome::Conflicted {
                    partial,
                    conflicts,
                    tombstones,
                }) => {
                    record.merged_result = Some(partial);
                    record.field_conflicts = conflicts;
                    record.tombstones = tombstones;
                }
                Err(e) => {
                    warn!("auto-merge for {} not possible: {e}", record.document_id);
                    record.strategy = ConflictStrategy::Manual;
                }
            }
        }

        info!(
            "conflict {} on {}: {:?} ({} colliding field(s))",
            record.conflict_id,
            record.document_id,
            record.resolution,
            record.field_conflicts.len()
        );
        self.services.metrics.record(
            Operation::ConflictResolve,
            started.elapsed().as_secs_f64() * 1000.0,
            record.resolution == Resolution::Resolved,
            SampleMetadata {
                conflict_type: Some(record.client_version.shape().to_string()),
                ..SampleMetadata::default()
            },
        );

        self.lock().conflicts.push(record.clone());
        self.conflict_listeners.emit(&record);
        Ok(record)
    }

    /// Replace the conflicted item's payload with `document` and make it
    /// eligible for the next drain.
    fn requeue_with(&self, record: &ConflictRecord, document: &Document) -> Result<(), EngineError> {
        let payload = SavePayload::from_document(
            &self.services.codec,
            record.document_id,
            document,
            record.client_version_number,
            record.server_version_number,
            record.session_id.clone(),
        )?;
        let now = self.services.clock.now_ms();

        let exists = {
            let mut state = self.lock();
            match state.item_mut(&record.item_id) {
                Some(item) => {
                    item.payload = payload.clone();
                    item.status = ItemStatus::Pending;
                    item.not_before_ms = now;
                    item.last_error = None;
                    true
                }
                None => false,
            }
        };
        if !exists {
            warn!(
                "conflicted item {} no longer queued, enqueueing resolved content",
                record.item_id
            );
            self.enqueue(payload, Priority::High)?;
        }
        Ok(())
    }

    /// Settle a conflict explicitly and requeue the chosen content.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolveStrategy,
        merged: Option<Document>,
    ) -> Result<ConflictRecord, EngineError> {
        let mut record = self
            .conflict(conflict_id)
            .ok_or_else(|| EngineError::UnknownConflict(conflict_id.to_string()))?;

        let chosen = match strategy {
            ResolveStrategy::ServerWins => None,
            ResolveStrategy::ClientWins => Some(record.client_version.clone()),
            ResolveStrategy::Merge => Some(
                merged
                    .or_else(|| record.merged_result.clone())
                    .ok_or_else(|| EngineError::ConflictDetected {
                        item_id: record.item_id.clone(),
                    })?,
            ),
        };

        match &chosen {
            Some(document) => self.requeue_with(&record, document)?,
            // The server already holds its version: nothing left to send.
            None => {
                self.lock().take_item(&record.item_id);
            }
        }

        let now = self.services.clock.now_ms();
        record.strategy = strategy.into();
        record.resolution = Resolution::Resolved;
        record.resolved_at_ms = Some(now);
        record.merged_result = match strategy {
            ResolveStrategy::ServerWins => Some(record.server_version.clone()),
            _ => chosen,
        };
        {
            let mut state = self.lock();
            if let Some(stored) = state
                .conflicts
                .iter_mut()
                .find(|c| c.conflict_id == conflict_id)
            {
                *stored = record.clone();
            }
        }
        info!("conflict {conflict_id} resolved ({strategy:?})");
        self.services.metrics.record(
            Operation::ConflictResolve,
            0.0,
            true,
            SampleMetadata {
                conflict_type: Some("manual".into()),
                ..SampleMetadata::default()
            },
        );
        self.persist();
        self.conflict_listeners.emit(&record);
        Ok(record)
    }

    pub fn conflict(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.lock()
            .conflicts
            .iter()
            .find(|c| c.conflict_id == conflict_id)
            .cloned()
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.lock().conflicts.clone()
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.lock()
            .conflicts
            .iter()
            .filter(|c| c.is_pending())
            .cloned()
            .collect()
    }

    pub fn conflicts_for(&self, doc: DocumentId) -> Vec<ConflictRecord> {
        self.lock()
            .conflicts
            .iter()
            .filter(|c| c.document_id == doc)
            .cloned()
            .collect()
    }

    /// Drop settled records. Pending records are always kept.
    pub fn prune_resolved_conflicts(&self) -> usize {
        let removed = {
            let mut state = self.lock();
            let before = state.conflicts.len();
            state.conflicts.retain(|c| c.is_pending());
            before - state.conflicts.len()
        };
        if removed > 0 {
            self.persist();
        }
        removed
    }

    // ─── Introspection ────────────────────────────────────────────────

    /// Snapshot in drain order.
    pub fn items(&self) -> Vec<SyncQueueItem> {
        let mut items = self.lock().items.clone();
        order_for_delivery(&mut items);
        items
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_ready_items(&self) -> bool {
        let now = self.services.clock.now_ms();
        self.lock().items.iter().any(|i| i.is_ready(now))
    }

    pub fn escalated_count(&self) -> u64 {
        self.lock().escalated
    }

    pub fn data_loss_count(&self) -> u64 {
        self.lock().data_loss
    }

    pub fn metrics(&self) -> OfflineMetrics {
        let now = self.services.clock.now_ms();
        let state = self.lock();
        let pending_items = state
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .count();
        let conflict_items = state
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Conflict)
            .count();
        let current_outage = state
            .offline_since_ms
            .map_or(0, |since| now.saturating_sub(since));
        OfflineMetrics {
            total_items: state.items.len(),
            pending_items,
            conflict_items,
            synced_items: state.synced,
            failed_attempts: state.failed_attempts,
            escalated_items: state.escalated,
            data_loss_count: state.data_loss,
            evicted_items: state.evicted,
            pending_conflicts: state.conflicts.iter().filter(|c| c.is_pending()).count(),
            average_sync_ms: if state.synced == 0 {
                0.0
            } else {
                state.sync_time_total_ms / state.synced as f64
            },
            offline_duration_ms: state.offline_total_ms + current_outage,
            network: self.services.network.status(),
            last_sync_ms: state.last_sync_ms,
        }
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn subscribe_conflicts(
        &self,
        listener: impl Fn(&ConflictRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.conflict_listeners.subscribe(listener)
    }

    pub fn unsubscribe_conflicts(&self, id: SubscriptionId) -> bool {
        self.conflict_listeners.unsubscribe(id)
    }

    /// Notified after every drain that sent at least one item.
    pub fn subscribe_drains(
        &self,
        listener: impl Fn(&DrainReport) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.drain_listeners.subscribe(listener)
    }

    pub fn unsubscribe_drains(&self, id: SubscriptionId) -> bool {
        self.drain_listeners.unsubscribe(id)
    }

    // ─── Background loop ──────────────────────────────────────────────

    fn note_network(&self, online: bool) {
        let now = self.services.clock.now_ms();
        let mut state = self.lock();
        match (online, state.offline_since_ms) {
            (false, None) => state.offline_since_ms = Some(now),
            (true, Some(since)) => {
                state.offline_total_ms += now.saturating_sub(since);
                state.offline_since_ms = None;
            }
            _ => {}
        }
    }

    /// Watch reachability: drain on every offline → online edge and
    /// periodically while online. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.is_some() {
            return;
        }
        if !self.services.network.is_online() {
            self.note_network(false);
        }
        let queue = Arc::downgrade(self);
        let mut reachability = self.services.network.subscribe();
        let interval = Duration::from_millis(self.config.sync_interval_ms.max(1));

        *watcher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = reachability.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *reachability.borrow_and_update();
                        let Some(queue) = queue.upgrade() else { break };
                        queue.note_network(online);
                        if online {
                            info!("network restored, draining offline queue");
                            queue.drain().await;
                        } else {
                            info!("network lost, saves will be queued");
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(queue) = queue.upgrade() else { break };
                        if queue.services.network.is_online() && queue.has_ready_items() {
                            queue.drain().await;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the background loop, persist and drop listeners.
    pub fn close(&self) {
        if let Some(handle) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.persist();
        self.conflict_listeners.clear();
        self.drain_listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use crate::item::tests::payload;
    use crate::metrics::MetricsConfig;
    use crate::runtime::{Clock, ManualClock, ManualScheduler, NetworkMonitor};
    use crate::services::EngineDeps;
    use crate::storage::{DurableStore, MemoryStore};
    use crate::transport::{SaveResponse, ScriptedTransport};
    use quire_core::{DocumentType, Entity};
    use serde_json::json;

    struct Harness {
        queue: Arc<OfflineQueue>,
        transport: Arc<ScriptedTransport>,
        services: Services,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: OfflineConfig, store: Arc<MemoryStore>, online: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let transport = Arc::new(ScriptedTransport::new());
        let deps = EngineDeps {
            clock: clock.clone(),
            scheduler: Arc::new(ManualScheduler::new(clock.clone())),
            store: store.clone(),
            transport: transport.clone(),
        };
        let services = Services::new(
            &deps,
            CodecConfig::for_testing(),
            MetricsConfig::for_testing(),
            Arc::new(NetworkMonitor::new(online)),
        );
        Harness {
            queue: OfflineQueue::new(config, services.clone()),
            transport,
            services,
            clock,
        }
    }

    fn harness(online: bool) -> Harness {
        harness_with(OfflineConfig::for_testing(), Arc::new(MemoryStore::new()), online)
    }

    fn item_for(h: &Harness, document: &Document) -> SyncQueueItem {
        let payload = SavePayload::from_document(
            &h.services.codec,
            DocumentId::new(),
            document,
            2,
            Some(1),
            "session",
        )
        .unwrap();
        SyncQueueItem::new(payload, Priority::High, 3, h.clock.now_ms())
    }

    #[tokio::test]
    async fn test_drain_priority_order() {
        let h = harness(false);
        let low = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Low).unwrap();
        h.clock.advance(Duration::from_millis(1));
        let critical = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Critical).unwrap();
        h.clock.advance(Duration::from_millis(1));
        let medium = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Medium).unwrap();

        assert!(h.queue.drain().await.skipped);
        assert_eq!(h.transport.request_count(), 0);

        h.services.network.set_online(true);
        let report = h.queue.drain().await;
        assert_eq!(report.sent, vec![critical.clone(), medium.clone(), low.clone()]);
        assert_eq!(report.synced, 3);
        assert!(h.queue.is_empty());

        let sent: Vec<Option<String>> =
            h.transport.requests().into_iter().map(|r| r.item_id).collect();
        assert_eq!(sent, vec![Some(critical), Some(medium), Some(low)]);
    }

    #[tokio::test]
    async fn test_queue_persisted_and_restored() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_with(OfflineConfig::for_testing(), store.clone(), false);
        let id = first.queue.enqueue(payload(DocumentId::new(), 3), Priority::High).unwrap();
        assert!(store.get(keys::OFFLINE_QUEUE).unwrap().is_some());

        let second = harness_with(OfflineConfig::for_testing(), store, true);
        let items = second.queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);

        let report = second.queue.drain().await;
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_lowest() {
        let config = OfflineConfig {
            max_queue_size: 2,
            ..OfflineConfig::for_testing()
        };
        let h = harness_with(config, Arc::new(MemoryStore::new()), false);
        let old_low = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Low).unwrap();
        h.clock.advance(Duration::from_millis(1));
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Low).unwrap();
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::High).unwrap();

        assert_eq!(h.queue.len(), 2);
        assert!(h.queue.items().iter().all(|i| i.id != old_low));
        let backup = h.services.backup.get(&old_low).unwrap().unwrap();
        assert_eq!(backup.reason, BackupReason::QueueOverflow);
        assert_eq!(h.queue.metrics().evicted_items, 1);
    }

    #[tokio::test]
    async fn test_overflow_rejects_lower_priority_newcomer() {
        let config = OfflineConfig {
            max_queue_size: 1,
            ..OfflineConfig::for_testing()
        };
        let h = harness_with(config, Arc::new(MemoryStore::new()), false);
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Critical).unwrap();
        let result = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Low);
        assert!(matches!(result, Err(EngineError::QueueOverflow { capacity: 1 })));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_escalates() {
        let h = harness(true);
        h.transport
            .push_failures(4, TransportError::Transient("503".into()));
        let id = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Medium).unwrap();

        let report = h.queue.drain().await;
        assert_eq!(report.retried, 1);
        let item = &h.queue.items()[0];
        assert_eq!(item.retry_count, 1);
        assert!(item.not_before_ms > h.clock.now_ms());

        // Not eligible until the backoff elapses.
        assert_eq!(h.queue.drain().await.attempted, 0);

        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(1));
            h.queue.drain().await;
        }
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.escalated_count(), 1);
        assert_eq!(h.queue.data_loss_count(), 1);
        let backup = h.services.backup.get(&id).unwrap().unwrap();
        assert_eq!(backup.reason, BackupReason::MaxRetriesExceeded);
        assert_eq!(backup.item.retry_count, 3);
        assert_eq!(h.transport.request_count(), 4);

        let critical = h.services.metrics.recent_alerts(10);
        assert!(critical
            .iter()
            .any(|a| a.severity == crate::metrics::Severity::Critical));
    }

    #[tokio::test]
    async fn test_permanent_failure_escalates_immediately() {
        let h = harness(true);
        h.transport
            .push(Err(TransportError::from_status(422, "invalid body")));
        let id = h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Medium).unwrap();

        let report = h.queue.drain().await;
        assert_eq!(report.escalated, 1);
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.data_loss_count(), 0);
        let backup = h.services.backup.get(&id).unwrap().unwrap();
        assert_eq!(backup.reason, BackupReason::Rejected);
        assert_eq!(backup.item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_versions_of_a_document_drain_in_order() {
        let h = harness(false);
        let doc = DocumentId::new();
        let older = h.queue.enqueue(payload(doc, 1), Priority::Medium).unwrap();
        h.clock.advance(Duration::from_millis(1));
        let newer = h.queue.enqueue(payload(doc, 2), Priority::High).unwrap();

        h.services.network.set_online(true);
        let report = h.queue.drain().await;
        assert_eq!(report.sent, vec![older, newer]);
        let versions: Vec<u64> = h.transport.requests().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_retried_version_holds_newer_back() {
        let h = harness(true);
        let doc = DocumentId::new();
        h.transport
            .push(Err(TransportError::Transient("timeout".into())));
        h.queue.enqueue(payload(doc, 1), Priority::Medium).unwrap();
        h.queue.enqueue(payload(doc, 2), Priority::Medium).unwrap();

        let report = h.queue.drain().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(h.queue.len(), 2);
        assert!(h
            .queue
            .items()
            .iter()
            .all(|item| item.status == ItemStatus::Pending));

        // Still backing off: the newer version is not sent past it.
        assert_eq!(h.queue.drain().await.attempted, 0);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.queue.drain().await.synced, 2);
        let versions: Vec<u64> = h.transport.requests().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_eviction_backup_failure_alerts() {
        let config = OfflineConfig {
            max_queue_size: 1,
            ..OfflineConfig::for_testing()
        };
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(config, store.clone(), false);
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Low).unwrap();

        store.set_fail_writes(true);
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::High).unwrap();

        assert_eq!(h.queue.metrics().evicted_items, 1);
        assert_eq!(h.services.backup.preserved_count(), 0);
        let alerts = h.services.metrics.recent_alerts(10);
        assert!(alerts.iter().any(|a| {
            a.severity == crate::metrics::Severity::Critical
                && a.message.contains("could not be backed up")
        }));
    }

    #[tokio::test]
    async fn test_conflict_auto_merged_entities() {
        let h = harness(true);
        let base = Document::entities(
            DocumentType::Quiz,
            vec![Entity::new("q1").with("answer", "a")],
        );
        let server = Document::entities(
            DocumentType::Quiz,
            vec![
                Entity::new("q1").with("answer", "a"),
                Entity::new("s1").with("answer", "server"),
            ],
        );
        let client = Document::entities(
            DocumentType::Quiz,
            vec![
                Entity::new("q1").with("answer", "a"),
                Entity::new("c1").with("answer", "client"),
            ],
        );
        h.transport.push(Ok(SaveResponse::conflict(
            ConflictData {
                base_version: Some(base),
                server_version: server,
            },
            Some(7),
        )));

        let item = item_for(&h, &client);
        h.queue.admit(item).unwrap();
        let report = h.queue.drain().await;

        assert_eq!(report.conflicts, 1);
        // Second pass re-sends the merged content.
        assert_eq!(report.synced, 1);
        let conflicts = h.queue.conflicts();
        assert_eq!(conflicts.len(), 1);
        let record = &conflicts[0];
        assert_eq!(record.resolution, Resolution::Resolved);
        let merged = record.merged_result.as_ref().unwrap();
        assert!(merged.entity("c1").is_some());
        assert!(merged.entity("s1").is_some());

        let resent = &h.transport.requests()[1];
        assert_eq!(resent.base_version, Some(7));
    }

    #[tokio::test]
    async fn test_collision_held_pending_then_resolved() {
        let h = harness(true);
        let base = Document::fields(DocumentType::RichText, [("title", "x")]);
        let server = Document::fields(DocumentType::RichText, [("title", "server")]);
        let client = Document::fields(DocumentType::RichText, [("title", "client")]);
        h.transport.push(Ok(SaveResponse::conflict(
            ConflictData {
                base_version: Some(base),
                server_version: server.clone(),
            },
            Some(3),
        )));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        h.queue
            .subscribe_conflicts(move |c| s.lock().unwrap().push(c.resolution));

        h.queue.admit(item_for(&h, &client)).unwrap();
        h.queue.drain().await;

        let pending = h.queue.pending_conflicts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field_conflicts.len(), 1);
        assert_eq!(pending[0].field_conflicts[0].path, "body.title");
        assert_eq!(h.queue.items()[0].status, ItemStatus::Conflict);
        assert_eq!(h.queue.prune_resolved_conflicts(), 0);

        // Pending conflicts block delivery.
        assert_eq!(h.queue.drain().await.attempted, 0);

        let merged = Document::fields(DocumentType::RichText, [("title", "both")]);
        let resolved = h
            .queue
            .resolve_conflict(&pending[0].conflict_id, ResolveStrategy::Merge, Some(merged.clone()))
            .unwrap();
        assert_eq!(resolved.resolution, Resolution::Resolved);
        assert_eq!(resolved.strategy, ConflictStrategy::Merge);

        h.queue.drain().await;
        assert!(h.queue.is_empty());
        let last = h.transport.requests().pop().unwrap();
        let sent = Document::from_json(
            &h.services
                .codec
                .decompress(&last.body, last.algorithm, &last.content_hash)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(sent, merged);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Resolution::Pending, Resolution::Resolved]
        );
        assert_eq!(h.queue.prune_resolved_conflicts(), 1);
    }

    #[tokio::test]
    async fn test_server_wins_drops_item() {
        let server = Document::text(DocumentType::RichText, "server");
        let client = Document::text(DocumentType::RichText, "client");
        let config = OfflineConfig {
            enable_auto_merge: false,
            ..OfflineConfig::for_testing()
        };
        let h2 = harness_with(config, Arc::new(MemoryStore::new()), true);

        let record = h2
            .queue
            .accept_conflict(
                item_for(&h2, &client),
                ConflictData {
                    base_version: None,
                    server_version: server.clone(),
                },
                Some(4),
            )
            .unwrap();
        assert_eq!(record.strategy, ConflictStrategy::Manual);
        assert!(record.is_pending());

        let resolved = h2
            .queue
            .resolve_conflict(&record.conflict_id, ResolveStrategy::ServerWins, None)
            .unwrap();
        assert_eq!(resolved.merged_result, Some(server));
        assert!(h2.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conflict() {
        let h = harness(true);
        assert!(matches!(
            h.queue.resolve_conflict("nope", ResolveStrategy::ClientWins, None),
            Err(EngineError::UnknownConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_without_document_rejected() {
        let config = OfflineConfig {
            enable_auto_merge: false,
            ..OfflineConfig::for_testing()
        };
        let h2 = harness_with(config, Arc::new(MemoryStore::new()), true);
        let record = h2
            .queue
            .accept_conflict(
                item_for(&h2, &Document::text(DocumentType::RichText, "c")),
                ConflictData {
                    base_version: None,
                    server_version: Document::text(DocumentType::RichText, "s"),
                },
                None,
            )
            .unwrap();
        assert!(h2
            .queue
            .resolve_conflict(&record.conflict_id, ResolveStrategy::Merge, None)
            .is_err());
        assert!(h2.queue.conflict(&record.conflict_id).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_conflicts_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(OfflineConfig::for_testing(), store.clone(), true);
        let base = Document::fields(DocumentType::RichText, [("k", json!(1))]);
        let record = h
            .queue
            .accept_conflict(
                item_for(&h, &Document::fields(DocumentType::RichText, [("k", json!(2))])),
                ConflictData {
                    base_version: Some(base),
                    server_version: Document::fields(DocumentType::RichText, [("k", json!(3))]),
                },
                Some(5),
            )
            .unwrap();
        assert!(record.is_pending());

        let restarted = harness_with(OfflineConfig::for_testing(), store, true);
        assert_eq!(restarted.queue.pending_conflicts().len(), 1);
        assert_eq!(restarted.queue.items()[0].status, ItemStatus::Conflict);
    }

    #[tokio::test]
    async fn test_concurrent_drains_do_not_overlap() {
        let clock = Arc::new(ManualClock::new(0));
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(20)));
        let deps = EngineDeps {
            clock: clock.clone(),
            scheduler: Arc::new(ManualScheduler::new(clock.clone())),
            store: Arc::new(MemoryStore::new()),
            transport: transport.clone(),
        };
        let services = Services::new(
            &deps,
            CodecConfig::for_testing(),
            MetricsConfig::for_testing(),
            Arc::new(NetworkMonitor::new(true)),
        );
        let queue = OfflineQueue::new(OfflineConfig::for_testing(), services);
        for _ in 0..3 {
            queue.enqueue(payload(DocumentId::new(), 1), Priority::Medium).unwrap();
        }

        let (a, b) = tokio::join!(queue.drain(), queue.drain());
        assert!(a.skipped ^ b.skipped);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_drain() {
        let h = harness(false);
        h.queue.start();
        h.queue.enqueue(payload(DocumentId::new(), 1), Priority::Medium).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.transport.request_count(), 0);

        h.clock.advance(Duration::from_secs(3));
        h.services.network.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.request_count(), 1);

        let metrics = h.queue.metrics();
        assert_eq!(metrics.synced_items, 1);
        assert_eq!(metrics.offline_duration_ms, 3000);
        assert_eq!(metrics.network, NetworkStatus::Online);
        h.queue.close();
    }
}
