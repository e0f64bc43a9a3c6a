//! Batch scheduler: groups queued saves and sends them concurrently.
//!
//! Architecture:
//! ```text
//! enqueue ──► queue (bounded, persisted: queue/batch)
//!                 │ form_batch: priority desc, oldest first,
//!                 │   one item per document, oldest version first,
//!                 │   skip unresolved deps and backoff,
//!                 │   stop at max_batch_size / max_batch_bytes
//!                 ▼
//!   ┌──────────┐ ┌──────────┐      ┌──────────┐
//!   │ batch 1  │ │ batch 2  │ ...  │ batch N  │   N ≤ max_concurrent_batches
//!   └────┬─────┘ └────┬─────┘      └────┬─────┘   (semaphore permits)
//!        │ join_all per item            │
//!        ▼                              ▼
//!   synced │ conflict → OfflineQueue │ retry (not_before) │ backup
//! ```
//!
//! An item lives in exactly one place at a time: the queue or the
//! in-flight map of the batch carrying it. While a document has an item
//! in flight its newer versions stay queued, so a retried old version can
//! never land after a newer one.
//!
//! Only an item that exhausted its retries and was backed up counts as
//! data loss. Rejected or evicted items are backed up and alerted on
//! without touching the counter.

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use quire_core::DocumentId;

use crate::error::EngineError;
use crate::item::{
    eviction_candidate, order_for_delivery, queue_order, ItemStatus, Priority, SavePayload,
    SyncQueueItem,
};
use crate::listeners::{Listeners, SubscriptionId};
use crate::metrics::{Operation, SampleMetadata};
use crate::offline::OfflineQueue;
use crate::retry::RetryPolicy;
use crate::services::Services;
use crate::storage::{decode_record, encode_record, keys, BackupReason};
use crate::transport::{SaveRequest, SaveResponse, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per batch (default: 50)
    pub max_batch_size: usize,
    /// Payload bytes per batch (default: 10 MB)
    pub max_batch_bytes: usize,
    /// Batches in flight at once (default: 20)
    pub max_concurrent_batches: usize,
    /// Queue capacity (default: 10 000)
    pub max_queue_size: usize,
    /// Background cycle period (default: 100ms)
    pub tick_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_bytes: 10 * 1024 * 1024,
            max_concurrent_batches: 20,
            max_queue_size: 10_000,
            tick_ms: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn for_testing() -> Self {
        Self {
            max_batch_size: 4,
            max_batch_bytes: 64 * 1024,
            max_concurrent_batches: 2,
            max_queue_size: 16,
            tick_ms: 10,
            retry: RetryPolicy::for_testing(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Success,
    Partial,
    Failed,
}

/// Items sent together in one scheduling cycle.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub id: String,
    pub items: Vec<SyncQueueItem>,
    pub total_bytes: usize,
    pub priority: Priority,
    pub status: BatchStatus,
    pub created_at_ms: u64,
}

/// What happened to one item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResolution {
    Synced { server_version: Option<u64> },
    /// Handed to the offline queue's conflict path
    Conflict,
    Retrying { attempt: u32 },
    /// Backed up after exhausting retries; counted as data loss
    Escalated,
    /// Left the queue without exhausting retries (refused by the server,
    /// or no room to re-queue); backed up under `reason`
    Dropped { reason: BackupReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub item_id: String,
    pub document_id: DocumentId,
    pub version: u64,
    pub resolution: ItemResolution,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    pub items: Vec<ItemResult>,
    pub total_bytes: usize,
    pub duration_ms: f64,
}

impl BatchOutcome {
    pub fn count(&self, pred: impl Fn(&ItemResolution) -> bool) -> usize {
        self.items.iter().filter(|r| pred(&r.resolution)).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub batches: Vec<BatchOutcome>,
}

impl CycleReport {
    pub fn items_sent(&self) -> usize {
        self.batches.iter().map(|b| b.items.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub pending_items: usize,
    pub processing_items: usize,
    pub succeeded_items: u64,
    pub failed_items: u64,
    pub evicted_items: u64,
    pub data_loss_count: u64,
    pub total_batches: u64,
    pub average_batch_size: f64,
    pub average_processing_ms: f64,
    /// Synced items per second of batch processing time
    pub throughput_per_sec: f64,
}

#[derive(Default)]
struct SchedulerState {
    queue: Vec<SyncQueueItem>,
    in_flight: HashMap<String, SyncQueueItem>,
    succeeded: u64,
    failed: u64,
    evicted: u64,
    total_batches: u64,
    batched_items: u64,
    processing_ms_total: f64,
}

pub struct BatchScheduler {
    config: BatchConfig,
    services: Services,
    state: Mutex<SchedulerState>,
    permits: Arc<Semaphore>,
    data_loss: AtomicU64,
    conflicts: Option<Arc<OfflineQueue>>,
    outcome_listeners: Listeners<BatchOutcome>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Stale-base responses go to `conflicts` when given; without it they
    /// are treated as permanent failures.
    pub fn new(
        config: BatchConfig,
        services: Services,
        conflicts: Option<Arc<OfflineQueue>>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));
        let scheduler = Arc::new(Self {
            config,
            services,
            state: Mutex::new(SchedulerState::default()),
            permits,
            data_loss: AtomicU64::new(0),
            conflicts,
            outcome_listeners: Listeners::new(),
            worker: Mutex::new(None),
        });
        scheduler.restore();
        scheduler
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restore(&self) {
        let items: Vec<SyncQueueItem> = match self.services.store.get(keys::BATCH_QUEUE) {
            Ok(Some(bytes)) => decode_record(&bytes).unwrap_or_else(|e| {
                error!("batch queue snapshot unreadable, starting empty: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("batch queue restore failed: {e}");
                Vec::new()
            }
        };
        if items.is_empty() {
            return;
        }
        info!("restored {} batch item(s)", items.len());
        let mut state = self.lock();
        state.queue = items
            .into_iter()
            .map(|mut item| {
                item.status = ItemStatus::Pending;
                item
            })
            .collect();
        state.queue.sort_by(queue_order);
    }

    /// Snapshot queued and in-flight items; in-flight ones restore as
    /// pending after a crash.
    fn persist(&self) {
        let items: Vec<SyncQueueItem> = {
            let state = self.lock();
            state
                .queue
                .iter()
                .chain(state.in_flight.values())
                .cloned()
                .collect()
        };
        match encode_record(&items) {
            Ok(bytes) => {
                if let Err(e) = self.services.store.set(keys::BATCH_QUEUE, &bytes) {
                    error!("persisting batch queue failed: {e}");
                }
            }
            Err(e) => error!("encoding batch queue failed: {e}"),
        }
    }

    // ─── Enqueue ──────────────────────────────────────────────────────

    /// Queue a save. `dependencies` are item ids that must finish first.
    pub fn enqueue(
        &self,
        payload: SavePayload,
        priority: Priority,
        dependencies: Vec<String>,
    ) -> Result<String, EngineError> {
        let now = self.services.clock.now_ms();
        let item = SyncQueueItem::new(payload, priority, self.config.retry.max_retries, now)
            .with_dependencies(dependencies);
        let id = item.id.clone();
        self.admit(item)?;
        self.persist();
        debug!("batched {id} ({})", priority.as_str());
        Ok(id)
    }

    /// Insert keeping capacity. Only `low` items are evicted.
    fn admit(&self, item: SyncQueueItem) -> Result<(), EngineError> {
        let evicted = {
            let mut state = self.lock();
            let mut evicted = None;
            if state.queue.len() >= self.config.max_queue_size {
                match eviction_candidate(&state.queue, |i| i.priority == Priority::Low) {
                    Some(index) => {
                        evicted = Some(state.queue.remove(index));
                        state.evicted += 1;
                    }
                    None => {
                        return Err(EngineError::QueueOverflow {
                            capacity: self.config.max_queue_size,
                        })
                    }
                }
            }
            state.queue.push(item);
            state.queue.sort_by(queue_order);
            evicted
        };
        if let Some(victim) = evicted {
            warn!("batch queue full, evicting low-priority item {}", victim.id);
            if !self
                .services
                .preserve(Operation::Batch, &victim, BackupReason::QueueOverflow)
            {
                error!("evicted item {} is not in the emergency backup", victim.id);
            }
        }
        Ok(())
    }

    // ─── Scheduling ───────────────────────────────────────────────────

    /// Move the next group of ready items into flight.
    fn form_batch(&self) -> Option<BatchGroup> {
        let now = self.services.clock.now_ms();
        let mut state = self.lock();
        order_for_delivery(&mut state.queue);

        let unresolved: HashSet<&str> = state
            .queue
            .iter()
            .map(|i| i.id.as_str())
            .chain(state.in_flight.keys().map(String::as_str))
            .collect();
        // Documents already past their first queued item, or in flight.
        let mut claimed: HashSet<DocumentId> =
            state.in_flight.values().map(|i| i.document_id).collect();

        let mut picked = Vec::new();
        let mut total_bytes = 0usize;
        for (index, item) in state.queue.iter().enumerate() {
            if picked.len() >= self.config.max_batch_size {
                break;
            }
            if !claimed.insert(item.document_id) {
                continue;
            }
            if !item.is_ready(now)
                || item
                    .dependencies
                    .iter()
                    .any(|dep| unresolved.contains(dep.as_str()))
            {
                continue;
            }
            let size = item.byte_size();
            // An oversized item still goes out, alone.
            if !picked.is_empty() && total_bytes + size > self.config.max_batch_bytes {
                break;
            }
            picked.push(index);
            total_bytes += size;
        }
        drop(unresolved);

        if picked.is_empty() {
            return None;
        }
        let mut items = Vec::with_capacity(picked.len());
        for index in picked.into_iter().rev() {
            let mut item = state.queue.remove(index);
            item.status = ItemStatus::Processing;
            state.in_flight.insert(item.id.clone(), item.clone());
            items.push(item);
        }
        items.reverse();

        Some(BatchGroup {
            id: Uuid::new_v4().to_string(),
            priority: items[0].priority,
            items,
            total_bytes,
            status: BatchStatus::Processing,
            created_at_ms: now,
        })
    }

    /// Form as many batches as there are free permits and run them
    /// concurrently.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let mut handles = Vec::new();
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let Some(group) = self.form_batch() else {
                break;
            };
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let outcome = scheduler.process_batch(group).await;
                drop(permit);
                outcome
            }));
        }

        let mut report = CycleReport::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(outcome) => report.batches.push(outcome),
                Err(e) => error!("batch task failed: {e}"),
            }
        }
        if !report.batches.is_empty() {
            self.persist();
        }
        report
    }

    /// Run cycles until nothing is ready.
    pub async fn flush(self: &Arc<Self>) -> usize {
        let mut sent = 0;
        loop {
            let report = self.run_cycle().await;
            if report.batches.is_empty() {
                return sent;
            }
            sent += report.items_sent();
        }
    }

    async fn process_batch(&self, mut group: BatchGroup) -> BatchOutcome {
        let started = Instant::now();
        let transport = &self.services.transport;
        let sends = group.items.iter().map(|item| async move {
            let request = SaveRequest::from_payload(&item.payload, Some(&item.id), item.priority);
            transport.send(&request).await
        });
        let responses = join_all(sends).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut results = Vec::with_capacity(group.items.len());
        for (item, response) in group.items.iter().zip(responses) {
            let resolution = self.settle(item, response);
            results.push(ItemResult {
                item_id: item.id.clone(),
                document_id: item.document_id,
                version: item.payload.version,
                resolution,
            });
        }

        let delivered = results
            .iter()
            .filter(|r| {
                matches!(
                    r.resolution,
                    ItemResolution::Synced { .. } | ItemResolution::Conflict
                )
            })
            .count();
        group.status = if delivered == results.len() {
            BatchStatus::Success
        } else if delivered == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        };

        {
            let mut state = self.lock();
            state.total_batches += 1;
            state.batched_items += results.len() as u64;
            state.processing_ms_total += duration_ms;
        }
        self.services.metrics.record(
            Operation::Batch,
            duration_ms,
            group.status != BatchStatus::Failed,
            SampleMetadata {
                data_size: Some(group.total_bytes),
                network: Some(self.services.network.status()),
                ..SampleMetadata::default()
            },
        );
        debug!(
            "batch {} ({} item(s), {} bytes): {:?}",
            group.id,
            results.len(),
            group.total_bytes,
            group.status
        );

        let outcome = BatchOutcome {
            batch_id: group.id,
            status: group.status,
            items: results,
            total_bytes: group.total_bytes,
            duration_ms,
        };
        self.outcome_listeners.emit(&outcome);
        outcome
    }

    /// Take the item out of flight and decide where it goes next.
    fn settle(
        &self,
        item: &SyncQueueItem,
        response: Result<SaveResponse, TransportError>,
    ) -> ItemResolution {
        let removed = self.lock().in_flight.remove(&item.id);
        let Some(mut item) = removed else {
            return ItemResolution::Escalated;
        };

        let error: EngineError = match response {
            Ok(response) if !response.conflict_detected => {
                self.lock().succeeded += 1;
                return ItemResolution::Synced {
                    server_version: response.server_version_number,
                };
            }
            Ok(response) => match (response.conflict_data, &self.conflicts) {
                (Some(data), Some(queue)) => {
                    let item_id = item.id.clone();
                    match queue.accept_conflict(item, data, response.server_version_number) {
                        Ok(_) => return ItemResolution::Conflict,
                        Err(e) => {
                            // The offline queue backs up what it cannot hold.
                            error!("conflict for {item_id} could not be recorded: {e}");
                            self.lock().failed += 1;
                            let reason = match e {
                                EngineError::QueueOverflow { .. } => BackupReason::QueueOverflow,
                                _ => BackupReason::Rejected,
                            };
                            return ItemResolution::Dropped { reason };
                        }
                    }
                }
                _ => TransportError::Permanent {
                    status: None,
                    message: "conflict without a merge path".into(),
                }
                .into(),
            },
            Err(e) => e.into(),
        };

        if !error.is_retryable() {
            self.drop_item(item, &error, BackupReason::Rejected);
            return ItemResolution::Dropped {
                reason: BackupReason::Rejected,
            };
        }
        if !self.config.retry.allows_retry(item.retry_count) {
            self.escalate(item, &error);
            return ItemResolution::Escalated;
        }

        item.retry_count += 1;
        item.status = ItemStatus::Pending;
        item.last_error = Some(error.to_string());
        item.not_before_ms = self.services.clock.now_ms()
            + self.config.retry.delay_for(item.retry_count).as_millis() as u64;
        let attempt = item.retry_count;
        match self.admit(item.clone()) {
            Ok(()) => {
                debug!("item {} retry {attempt} after: {error}", item.id);
                ItemResolution::Retrying { attempt }
            }
            Err(e) => {
                warn!("item {} could not be re-queued: {e}", item.id);
                self.drop_item(item, &e, BackupReason::QueueOverflow);
                ItemResolution::Dropped {
                    reason: BackupReason::QueueOverflow,
                }
            }
        }
    }

    /// Retries exhausted: backup once, then count the loss once and alert.
    fn escalate(&self, mut item: SyncQueueItem, cause: &EngineError) {
        item.status = ItemStatus::Failed;
        item.last_error = Some(cause.to_string());
        self.lock().failed += 1;

        let exhausted = EngineError::MaxRetriesExceeded {
            item_id: item.id.clone(),
            retries: item.retry_count,
        };
        error!("{exhausted}: {cause}");
        if !self
            .services
            .preserve(Operation::Batch, &item, BackupReason::MaxRetriesExceeded)
        {
            return;
        }
        let lost = self.data_loss.fetch_add(1, Ordering::AcqRel) + 1;
        let loss = EngineError::DataLoss {
            item_id: item.id.clone(),
        };
        error!("{loss} (total lost: {lost})");
        self.services.metrics.raise_critical(
            Operation::Batch,
            format!(
                "Save for document {} failed after {} retries",
                item.document_id, item.retry_count
            ),
            lost as f64,
            Some("The change is kept in the local emergency backup".to_string()),
        );
    }

    /// Terminal failure before retries ran out: backup and alert, no loss.
    fn drop_item(&self, mut item: SyncQueueItem, cause: &EngineError, reason: BackupReason) {
        item.status = ItemStatus::Failed;
        item.last_error = Some(cause.to_string());
        self.lock().failed += 1;

        error!("item {} dropped from the batch queue ({reason:?}): {cause}", item.id);
        if self.services.preserve(Operation::Batch, &item, reason) {
            self.services.metrics.raise_critical(
                Operation::Batch,
                format!("Save for document {} was not accepted: {cause}", item.document_id),
                item.retry_count as f64,
                Some("The change is kept in the local emergency backup".to_string()),
            );
        }
    }

    // ─── Introspection ────────────────────────────────────────────────

    /// Queued items in scheduling order (in-flight items excluded).
    pub fn items(&self) -> Vec<SyncQueueItem> {
        let mut items = self.lock().queue.clone();
        order_for_delivery(&mut items);
        items
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn data_loss_count(&self) -> u64 {
        self.data_loss.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> BatchMetrics {
        let state = self.lock();
        let batches = state.total_batches as f64;
        let seconds = state.processing_ms_total / 1000.0;
        BatchMetrics {
            pending_items: state.queue.len(),
            processing_items: state.in_flight.len(),
            succeeded_items: state.succeeded,
            failed_items: state.failed,
            evicted_items: state.evicted,
            data_loss_count: self.data_loss_count(),
            total_batches: state.total_batches,
            average_batch_size: if batches > 0.0 {
                state.batched_items as f64 / batches
            } else {
                0.0
            },
            average_processing_ms: if batches > 0.0 {
                state.processing_ms_total / batches
            } else {
                0.0
            },
            throughput_per_sec: if seconds > 0.0 {
                state.succeeded as f64 / seconds
            } else {
                0.0
            },
        }
    }

    pub fn subscribe_outcomes(
        &self,
        listener: impl Fn(&BatchOutcome) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.outcome_listeners.subscribe(listener)
    }

    pub fn unsubscribe_outcomes(&self, id: SubscriptionId) -> bool {
        self.outcome_listeners.unsubscribe(id)
    }

    // ─── Background loop ──────────────────────────────────────────────

    /// Run a cycle every `tick_ms` while online. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }
        let scheduler = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.tick_ms.max(1));
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                if scheduler.services.network.is_online() && !scheduler.is_empty() {
                    scheduler.run_cycle().await;
                }
            }
        }));
    }

    /// Stop the background loop and persist. In-flight batches finish on
    /// their own tasks.
    pub fn close(&self) {
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.persist();
        self.outcome_listeners.clear();
    }
}
