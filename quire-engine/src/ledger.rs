//! Per-document version history.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ VersionLedger (one per DocumentId)                    │
//! │                                                       │
//! │  LRU { v7, v8, ..., v56 }  ◄── push(v57) evicts v7    │
//! │  next_version = 57  (never reused, survives eviction) │
//! │  last_synced_version                                  │
//! │                                                       │
//! │  each version: content snapshot + changeset vs prev   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A full ledger always drops its lowest version number, whatever order
//! versions arrived in; a version older than everything kept is not
//! stored at all. `next_version` is also persisted on its own key so a
//! damaged snapshot cannot make numbering start over.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Version Vectors)

use log::{debug, trace};
use lru::LruCache;
use quire_core::{diff_documents, ChangeRecord, ContentBody, ContentError, Document, DocumentId};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::codec::content_hash;
use crate::storage::{
    decode_json, decode_record, encode_json, encode_record, keys, DurableStore, StoreError,
};

/// Estimated compressed size relative to JSON size.
const COMPRESSED_SIZE_ESTIMATE: f64 = 0.4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Versions kept per document (default: 50)
    pub max_history: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { max_history: 50 }
    }
}

impl LedgerConfig {
    pub fn for_testing() -> Self {
        Self { max_history: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub session_id: String,
    pub author: Option<String>,
    pub byte_size: usize,
    pub compression_ratio: Option<f64>,
}

/// An immutable snapshot in a document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub version: u64,
    pub timestamp_ms: u64,
    pub content_hash: String,
    pub change_kind: ChangeKind,
    pub changeset: Vec<ChangeRecord>,
    pub content: Document,
    pub metadata: VersionMetadata,
}

/// Versions between two bounds, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalData {
    pub versions: Vec<Arc<ContentVersion>>,
    pub total_changes: usize,
    /// Rough compressed size of the changesets
    pub estimated_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionStats {
    pub total_versions: usize,
    pub current_version: u64,
    pub last_synced_version: u64,
    pub pending_versions: usize,
    pub total_changes: usize,
    pub storage_bytes: usize,
}

#[derive(Serialize, Deserialize)]
struct LedgerSnapshot {
    next_version: u64,
    last_synced_version: u64,
    versions: Vec<ContentVersion>,
}

pub struct VersionLedger {
    document_id: DocumentId,
    versions: LruCache<u64, Arc<ContentVersion>>,
    latest: Option<Arc<ContentVersion>>,
    next_version: u64,
    last_synced_version: u64,
}

impl VersionLedger {
    pub fn new(document_id: DocumentId, config: &LedgerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_history).unwrap_or(NonZeroUsize::MIN);
        Self {
            document_id,
            versions: LruCache::new(capacity),
            latest: None,
            next_version: 1,
            last_synced_version: 0,
        }
    }

    /// Empty ledger that hands out numbers from `next_version` on, for a
    /// document whose history was lost.
    pub fn resume(document_id: DocumentId, config: &LedgerConfig, next_version: u64) -> Self {
        let mut ledger = Self::new(document_id, config);
        ledger.next_version = next_version.max(1);
        ledger
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Record `content` as the next version, diffed against the latest.
    pub fn create_version(
        &mut self,
        content: &Document,
        session_id: &str,
        author: Option<&str>,
        compression_ratio: Option<f64>,
        now_ms: u64,
    ) -> Result<Arc<ContentVersion>, ContentError> {
        let bytes = content.to_canonical_json()?;
        let (change_kind, changeset) = match &self.latest {
            Some(previous) => (ChangeKind::Update, diff_documents(&previous.content, content)),
            None => {
                let empty = Document::new(content.doc_type.clone(), ContentBody::empty(content.shape()));
                (ChangeKind::Create, diff_documents(&empty, content))
            }
        };

        let version = Arc::new(ContentVersion {
            version: self.next_version,
            timestamp_ms: now_ms,
            content_hash: content_hash(&bytes),
            change_kind,
            changeset,
            content: content.clone(),
            metadata: VersionMetadata {
                session_id: session_id.to_string(),
                author: author.map(str::to_string),
                byte_size: bytes.len(),
                compression_ratio,
            },
        });
        self.next_version += 1;
        self.insert(Arc::clone(&version));

        debug!(
            "{} v{}: {} change(s)",
            self.document_id,
            version.version,
            version.changeset.len()
        );
        Ok(version)
    }

    fn insert(&mut self, version: Arc<ContentVersion>) {
        let number = version.version;
        if !self.versions.contains(&number) && self.versions.len() >= self.versions.cap().get() {
            match self.versions.iter().map(|(n, _)| *n).min() {
                Some(oldest) if oldest > number => {
                    trace!("{} v{number} older than kept history, skipped", self.document_id);
                    return;
                }
                Some(oldest) => {
                    self.versions.pop(&oldest);
                    trace!("{} evicted v{oldest}", self.document_id);
                }
                None => {}
            }
        }
        if self
            .latest
            .as_ref()
            .map_or(true, |latest| latest.version < number)
        {
            self.latest = Some(Arc::clone(&version));
        }
        self.versions.put(number, version);
    }

    pub fn latest(&self) -> Option<Arc<ContentVersion>> {
        self.latest.clone()
    }

    /// Latest version number, 0 before the first version.
    pub fn current_version(&self) -> u64 {
        self.latest.as_ref().map_or(0, |v| v.version)
    }

    pub fn get_version(&self, version: u64) -> Option<Arc<ContentVersion>> {
        self.versions.peek(&version).cloned()
    }

    /// Deep copy of a stored version's content.
    pub fn rollback_to_version(&self, version: u64) -> Option<Document> {
        self.versions.peek(&version).map(|v| v.content.clone())
    }

    /// Versions with `from < version < to` (`to = None`: everything after
    /// `from`, latest included).
    pub fn get_incremental_data(&self, from: u64, to: Option<u64>) -> IncrementalData {
        let mut versions: Vec<Arc<ContentVersion>> = self
            .versions
            .iter()
            .filter(|(n, _)| **n > from && to.map_or(true, |to| **n < to))
            .map(|(_, v)| Arc::clone(v))
            .collect();
        versions.sort_by_key(|v| v.version);

        let total_changes = versions.iter().map(|v| v.changeset.len()).sum();
        let json_bytes: usize = versions
            .iter()
            .map(|v| serde_json::to_vec(&v.changeset).map(|b| b.len()).unwrap_or(0))
            .sum();

        IncrementalData {
            versions,
            total_changes,
            estimated_bytes: (json_bytes as f64 * COMPRESSED_SIZE_ESTIMATE).ceil() as usize,
        }
    }

    /// Ingest versions received from elsewhere. Returns the new
    /// `last_synced_version`.
    pub fn apply_incremental_update(&mut self, mut versions: Vec<ContentVersion>) -> u64 {
        versions.sort_by_key(|v| v.version);
        for version in versions {
            let number = version.version;
            if !self.versions.contains(&number) {
                self.insert(Arc::new(version));
            }
            self.next_version = self.next_version.max(number + 1);
            self.last_synced_version = self.last_synced_version.max(number);
        }
        self.last_synced_version
    }

    /// Mark everything up to `version` as acknowledged by the server.
    pub fn mark_synced(&mut self, version: u64) {
        let bounded = version.min(self.next_version.saturating_sub(1));
        self.last_synced_version = self.last_synced_version.max(bounded);
    }

    pub fn last_synced_version(&self) -> u64 {
        self.last_synced_version
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<Arc<ContentVersion>> {
        let mut all: Vec<Arc<ContentVersion>> =
            self.versions.iter().map(|(_, v)| Arc::clone(v)).collect();
        all.sort_by(|a, b| b.version.cmp(&a.version));
        all.truncate(limit);
        all
    }

    pub fn stats(&self) -> VersionStats {
        let mut stats = VersionStats {
            total_versions: self.versions.len(),
            current_version: self.current_version(),
            last_synced_version: self.last_synced_version,
            pending_versions: 0,
            total_changes: 0,
            storage_bytes: 0,
        };
        for (&number, version) in self.versions.iter() {
            if number > self.last_synced_version {
                stats.pending_versions += 1;
            }
            stats.total_changes += version.changeset.len();
            stats.storage_bytes += version.metadata.byte_size;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    // ─── Persistence ──────────────────────────────────────────────────

    pub fn persist(&self, store: &dyn DurableStore) -> Result<(), StoreError> {
        let mut versions: Vec<ContentVersion> =
            self.versions.iter().map(|(_, v)| (**v).clone()).collect();
        versions.sort_by_key(|v| v.version);
        let snapshot = LedgerSnapshot {
            next_version: self.next_version,
            last_synced_version: self.last_synced_version,
            versions,
        };
        store.set(&keys::versions(self.document_id), &encode_json(&snapshot)?)?;
        store.set(
            &keys::version_counter(self.document_id),
            &encode_record(&self.next_version)?,
        )
    }

    /// The persisted `next_version` of a document, read without its
    /// snapshot.
    pub fn stored_next_version(
        document_id: DocumentId,
        store: &dyn DurableStore,
    ) -> Result<Option<u64>, StoreError> {
        store
            .get(&keys::version_counter(document_id))?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Load a persisted ledger, or start empty if none exists.
    pub fn restore(
        document_id: DocumentId,
        config: &LedgerConfig,
        store: &dyn DurableStore,
    ) -> Result<Self, StoreError> {
        let mut ledger = Self::new(document_id, config);
        let Some(bytes) = store.get(&keys::versions(document_id))? else {
            return Ok(ledger);
        };
        let snapshot: LedgerSnapshot = decode_json(&bytes)?;
        for version in snapshot.versions {
            ledger.next_version = ledger.next_version.max(version.version + 1);
            ledger.insert(Arc::new(version));
        }
        ledger.next_version = ledger.next_version.max(snapshot.next_version);
        ledger.last_synced_version = snapshot.last_synced_version;
        debug!(
            "restored {} versions for {document_id} (next v{})",
            ledger.len(),
            ledger.next_version
        );
        Ok(ledger)
    }
}
