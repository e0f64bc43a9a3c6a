//! Offline replay order and batched delivery, driven through the
//! orchestrator's queues.

use quire_core::{Document, DocumentId, DocumentType};
use quire_engine::storage::{decode_record, keys};
use quire_engine::{
    BackupReason, BackupRecord, DurableStore, EngineConfig, EngineDeps, EngineError, ManualClock,
    ManualScheduler, MemoryStore, Priority, SaveOrchestrator, SaveOutcome, SavePayload,
    SaveStatus, ScriptedTransport, Severity, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: SaveOrchestrator,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    transport: Arc<ScriptedTransport>,
}

fn harness_with(config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new());
    let deps = EngineDeps {
        clock: clock.clone(),
        scheduler: Arc::new(ManualScheduler::new(clock.clone())),
        store: store.clone(),
        transport: transport.clone(),
    };
    Harness {
        engine: SaveOrchestrator::new(config, deps),
        clock,
        store,
        transport,
    }
}

fn batching() -> EngineConfig {
    let mut config = EngineConfig::for_testing();
    config.orchestrator.enable_batching = true;
    config
}

fn text(body: &str) -> Document {
    Document::text(DocumentType::RichText, body)
}

fn payload(h: &Harness, body: &str) -> SavePayload {
    SavePayload::from_document(
        h.engine.codec(),
        DocumentId::new(),
        &text(body),
        1,
        None,
        "integration",
    )
    .unwrap()
}

fn backup_of(h: &Harness, item_id: &str) -> Option<BackupRecord> {
    h.store
        .get(&keys::backup(item_id))
        .unwrap()
        .map(|bytes| decode_record(&bytes).unwrap())
}

#[tokio::test]
async fn test_offline_replay_follows_priority() {
    let h = harness_with(EngineConfig::for_testing());
    h.engine.set_online(false);
    let offline = h.engine.offline();
    offline.enqueue(payload(&h, "low"), Priority::Low).unwrap();
    h.clock.advance(Duration::from_millis(1));
    offline.enqueue(payload(&h, "critical"), Priority::Critical).unwrap();
    offline.enqueue(payload(&h, "medium"), Priority::Medium).unwrap();

    // Nothing goes out while offline.
    assert!(offline.drain().await.skipped);
    assert_eq!(h.transport.request_count(), 0);

    h.engine.set_online(true);
    let report = offline.drain().await;
    assert_eq!(report.synced, 3);
    let order: Vec<Priority> = h.transport.requests().iter().map(|r| r.priority).collect();
    assert_eq!(order, vec![Priority::Critical, Priority::Medium, Priority::Low]);
    assert!(offline.is_empty());
}

#[tokio::test]
async fn test_batched_save_completes_on_flush() {
    let h = harness_with(batching());
    let doc = DocumentId::new();

    let outcome = h.engine.force_save(doc, text("batched")).await;
    assert!(matches!(outcome, SaveOutcome::Batched { version: 1, .. }));
    assert_eq!(h.engine.save_state(doc).unwrap().queued_items, 1);
    assert_eq!(h.transport.request_count(), 0);

    assert_eq!(h.engine.batch().flush().await, 1);
    let state = h.engine.save_state(doc).unwrap();
    assert_eq!(state.status, SaveStatus::Saved);
    assert_eq!(state.queued_items, 0);
    assert_eq!(h.engine.version_stats(doc).last_synced_version, 1);
}

#[tokio::test]
async fn test_batch_overflow_evicts_low_priority_work() {
    let mut config = batching();
    config.batch.max_queue_size = 2;
    let h = harness_with(config);
    let batch = h.engine.batch();

    let low = batch.enqueue(payload(&h, "low"), Priority::Low, Vec::new()).unwrap();
    batch.enqueue(payload(&h, "medium"), Priority::Medium, Vec::new()).unwrap();

    let doc = DocumentId::new();
    let outcome = h.engine.force_save(doc, text("urgent")).await;
    assert!(matches!(outcome, SaveOutcome::Batched { .. }));
    assert_eq!(batch.len(), 2);
    assert!(batch.items().iter().all(|item| item.id != low));
    assert_eq!(backup_of(&h, &low).unwrap().reason, BackupReason::QueueOverflow);

    // No low item left to make room for another newcomer.
    let rejected = batch.enqueue(payload(&h, "more"), Priority::Medium, Vec::new());
    assert!(matches!(rejected, Err(EngineError::QueueOverflow { capacity: 2 })));
}

#[tokio::test]
async fn test_batch_retry_exhaustion_loses_once() {
    let h = harness_with(batching());
    h.transport
        .push_failures(10, TransportError::Transient("502 Bad Gateway".into()));
    let doc = DocumentId::new();

    let item_id = match h.engine.force_save(doc, text("unlucky")).await {
        SaveOutcome::Batched { item_id, .. } => item_id,
        other => panic!("expected a batched save, got {other:?}"),
    };

    let mut statuses = Vec::new();
    for _ in 0..6 {
        h.engine.batch().run_cycle().await;
        statuses.push(h.engine.save_state(doc).unwrap().status);
        h.clock.advance(Duration::from_secs(1));
    }
    assert_eq!(
        &statuses[..4],
        &[
            SaveStatus::Retrying { attempt: 1 },
            SaveStatus::Retrying { attempt: 2 },
            SaveStatus::Retrying { attempt: 3 },
            SaveStatus::Failed,
        ]
    );
    assert_eq!(h.transport.request_count(), 4);

    let state = h.engine.save_state(doc).unwrap();
    assert_eq!(state.data_loss_count, 1);
    assert_eq!(state.queued_items, 0);
    assert!(state.last_error.is_some());

    let backups = h.store.keys_with_prefix(keys::BACKUP_PREFIX).unwrap();
    assert_eq!(backups, vec![keys::backup(&item_id)]);
    assert_eq!(
        backup_of(&h, &item_id).unwrap().reason,
        BackupReason::MaxRetriesExceeded
    );

    let critical = h
        .engine
        .metrics()
        .recent_alerts(50)
        .into_iter()
        .filter(|a| a.severity == Severity::Critical)
        .count();
    assert_eq!(critical, 1);
}
