//! Last-resort persistence: local fallback records for saves that could
//! not reach the server, and emergency backups of queue items that were
//! evicted or exhausted their retries.

use log::{error, info, warn};
use quire_core::DocumentId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{decode_record, encode_record, keys, DurableStore, StoreError};
use crate::codec::{Algorithm, CompressedPayload};
use crate::item::SyncQueueItem;
use crate::runtime::Clock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionMeta {
    pub algorithm: Algorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
}

/// Content of a save that failed after all direct retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub document_id: DocumentId,
    pub version: u64,
    pub content_hash: String,
    pub compressed_payload: Vec<u8>,
    pub compression: CompressionMeta,
    pub timestamp_ms: u64,
}

impl FallbackRecord {
    pub fn new(
        document_id: DocumentId,
        version: u64,
        payload: &CompressedPayload,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            document_id,
            version,
            content_hash: payload.hash.clone(),
            compressed_payload: payload.bytes.clone(),
            compression: CompressionMeta {
                algorithm: payload.algorithm,
                original_size: payload.original_size,
                compressed_size: payload.compressed_size,
                ratio: payload.ratio,
            },
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    MaxRetriesExceeded,
    QueueOverflow,
    /// The server refused the item outright (4xx, unreadable payload)
    Rejected,
}

/// A queue item preserved outside any queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub item: SyncQueueItem,
    pub backup_time_ms: u64,
    pub reason: BackupReason,
}

/// Writer for fallback and backup records.
pub struct EmergencyBackup {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    preserved: AtomicU64,
}

impl EmergencyBackup {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            preserved: AtomicU64::new(0),
        }
    }

    // ─── Local fallback ───────────────────────────────────────────────

    pub fn write_fallback(&self, record: &FallbackRecord) -> Result<(), StoreError> {
        let key = keys::fallback(record.document_id);
        self.store.set(&key, &encode_record(record)?)?;
        warn!(
            "save for {} v{} stored in local fallback ({} bytes)",
            record.document_id,
            record.version,
            record.compressed_payload.len()
        );
        Ok(())
    }

    pub fn read_fallback(&self, doc: DocumentId) -> Result<Option<FallbackRecord>, StoreError> {
        self.store
            .get(&keys::fallback(doc))?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    pub fn clear_fallback(&self, doc: DocumentId) -> Result<(), StoreError> {
        self.store.delete(&keys::fallback(doc))
    }

    // ─── Emergency backup ─────────────────────────────────────────────

    /// Persist an item that is leaving every queue. Returns the record key.
    pub fn preserve(&self, item: &SyncQueueItem, reason: BackupReason) -> Result<String, StoreError> {
        let record = BackupRecord {
            item: item.clone(),
            backup_time_ms: self.clock.now_ms(),
            reason,
        };
        let key = keys::backup(&item.id);
        match self.store.set(&key, &encode_record(&record)?) {
            Ok(()) => {
                self.preserved.fetch_add(1, Ordering::Relaxed);
                info!("item {} preserved in emergency backup ({reason:?})", item.id);
                Ok(key)
            }
            Err(e) => {
                error!("emergency backup of item {} failed: {e}", item.id);
                Err(e)
            }
        }
    }

    pub fn get(&self, item_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        self.store
            .get(&keys::backup(item_id))?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Every backup record, skipping unreadable entries.
    pub fn list(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(keys::BACKUP_PREFIX)? {
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            match decode_record::<BackupRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping unreadable backup {key}: {e}"),
            }
        }
        Ok(records)
    }

    pub fn remove(&self, item_id: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::backup(item_id))
    }

    /// Records written by this instance.
    pub fn preserved_count(&self) -> u64 {
        self.preserved.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecConfig, CompressionCodec};
    use crate::item::tests::item;
    use crate::item::Priority;
    use crate::runtime::ManualClock;
    use crate::storage::MemoryStore;

    fn backup() -> (EmergencyBackup, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let backup = EmergencyBackup::new(store.clone(), Arc::new(ManualClock::new(42)));
        (backup, store)
    }

    #[test]
    fn test_preserve_and_list() {
        let (backup, _) = backup();
        let a = item(Priority::Low, 1);
        let b = item(Priority::High, 2);

        let key = backup.preserve(&a, BackupReason::QueueOverflow).unwrap();
        assert_eq!(key, format!("backup/{}", a.id));
        backup.preserve(&b, BackupReason::MaxRetriesExceeded).unwrap();

        let records = backup.list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(backup.preserved_count(), 2);

        let got = backup.get(&a.id).unwrap().unwrap();
        assert_eq!(got.item, a);
        assert_eq!(got.reason, BackupReason::QueueOverflow);
        assert_eq!(got.backup_time_ms, 42);
    }

    #[test]
    fn test_fallback_roundtrip() {
        let (backup, _) = backup();
        let codec = CompressionCodec::new(CodecConfig::for_testing());
        let doc = DocumentId::new();
        let payload = codec.compress(&b"{\"k\":\"value value value value value\"}".repeat(4));
        let record = FallbackRecord::new(doc, 7, &payload, 1000);

        backup.write_fallback(&record).unwrap();
        let back = backup.read_fallback(doc).unwrap().unwrap();
        assert_eq!(back, record);
        assert_eq!(back.compression.algorithm, payload.algorithm);

        backup.clear_fallback(doc).unwrap();
        assert!(backup.read_fallback(doc).unwrap().is_none());
    }

    #[test]
    fn test_preserve_failure_reported() {
        let (backup, store) = backup();
        store.set_fail_writes(true);
        assert!(backup
            .preserve(&item(Priority::Low, 1), BackupReason::QueueOverflow)
            .is_err());
        assert_eq!(backup.preserved_count(), 0);
    }
}
