//! Durable key-value storage for queues, version ledgers and local
//! fallback records.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  ┌─────────────┐  ┌──────────────┐
//! │ OfflineQueue │  │ BatchSched. │  │ Orchestrator │
//! └──────┬───────┘  └──────┬──────┘  └──────┬───────┘
//!        │                 │                │
//!        └────────┬────────┴────────┬───────┘
//!                 ▼                 ▼
//!          ┌─────────────────────────────┐
//!          │ dyn DurableStore            │
//!          │   MemoryStore   (tests/CLI) │
//!          │   RocksStore    (feature)   │
//!          └─────────────────────────────┘
//! ```
//!
//! Key layout:
//!
//! | Key                 | Value                                  |
//! |---------------------|----------------------------------------|
//! | `queue/offline`     | bincode `Vec<SyncQueueItem>`           |
//! | `queue/batch`       | bincode `Vec<SyncQueueItem>`           |
//! | `queue/conflicts`   | JSON `Vec<ConflictRecord>`             |
//! | `versions/<doc>`    | JSON ledger snapshot                   |
//! | `versions/<doc>/next` | bincode next version number          |
//! | `fallback/<doc>`    | bincode `FallbackRecord`               |
//! | `backup/<item id>`  | bincode `BackupRecord`                 |
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Storage and Retrieval)

pub mod backup;
pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use backup::{BackupReason, BackupRecord, CompressionMeta, EmergencyBackup, FallbackRecord};
pub use memory::MemoryStore;
#[cfg(feature = "rocks")]
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous byte store addressed by string keys.
///
/// Implementations must be safe to call from any thread; writes are
/// expected to be durable once `set` returns.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Well-known keys.
pub mod keys {
    use quire_core::DocumentId;

    pub const OFFLINE_QUEUE: &str = "queue/offline";
    pub const BATCH_QUEUE: &str = "queue/batch";
    pub const CONFLICTS: &str = "queue/conflicts";
    pub const BACKUP_PREFIX: &str = "backup/";
    pub const FALLBACK_PREFIX: &str = "fallback/";

    pub fn versions(doc: DocumentId) -> String {
        format!("versions/{doc}")
    }

    pub fn version_counter(doc: DocumentId) -> String {
        format!("versions/{doc}/next")
    }

    pub fn fallback(doc: DocumentId) -> String {
        format!("{FALLBACK_PREFIX}{doc}")
    }

    pub fn backup(item_id: &str) -> String {
        format!("{BACKUP_PREFIX}{item_id}")
    }
}

/// bincode (serde mode, standard config) record encoding.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// JSON encoding for records that carry `serde_json::Value` content.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}
