//! Queue items shared by the offline queue and the batch scheduler.

use quire_core::{Document, DocumentId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::codec::{Algorithm, CompressedPayload, CompressionCodec};
use crate::error::EngineError;

/// Save priority. Ordered so that `Critical` is the greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Scheduling weight (critical 4 ... low 1).
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
    /// Waiting on an unresolved conflict; not sent until resolved.
    Conflict,
}

/// Compressed content plus the metadata the save endpoint needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavePayload {
    pub document_id: DocumentId,
    /// Version declared by the client ledger
    pub version: u64,
    /// Last version the server acknowledged, if any
    pub base_version: Option<u64>,
    pub session_id: String,
    pub content_hash: String,
    pub algorithm: Algorithm,
    pub ratio: f64,
    pub original_size: usize,
    pub body: Vec<u8>,
}

impl SavePayload {
    pub fn new(
        document_id: DocumentId,
        version: u64,
        base_version: Option<u64>,
        session_id: impl Into<String>,
        compressed: CompressedPayload,
    ) -> Self {
        Self {
            document_id,
            version,
            base_version,
            session_id: session_id.into(),
            content_hash: compressed.hash,
            algorithm: compressed.algorithm,
            ratio: compressed.ratio,
            original_size: compressed.original_size,
            body: compressed.bytes,
        }
    }

    /// Encode and compress `document` into a payload.
    pub fn from_document(
        codec: &CompressionCodec,
        document_id: DocumentId,
        document: &Document,
        version: u64,
        base_version: Option<u64>,
        session_id: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let bytes = document.to_canonical_json()?;
        let compressed = codec.compress(&bytes);
        Ok(Self::new(document_id, version, base_version, session_id, compressed))
    }

    /// Decompress, verify and parse the carried document.
    pub fn decode_document(&self, codec: &CompressionCodec) -> Result<Document, EngineError> {
        let bytes = codec.decompress(&self.body, self.algorithm, &self.content_hash)?;
        Ok(Document::from_json(&bytes)?)
    }

    /// Bytes on the wire.
    pub fn byte_size(&self) -> usize {
        self.body.len()
    }
}

/// A save waiting in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub document_id: DocumentId,
    pub payload: SavePayload,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    /// Items that must complete before this one is sent
    pub dependencies: Vec<String>,
    /// Backoff: not eligible before this time
    pub not_before_ms: u64,
}

impl SyncQueueItem {
    pub fn new(payload: SavePayload, priority: Priority, max_retries: u32, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: payload.document_id,
            payload,
            priority,
            enqueued_at_ms: now_ms,
            retry_count: 0,
            max_retries,
            status: ItemStatus::Pending,
            last_error: None,
            dependencies: Vec::new(),
            not_before_ms: now_ms,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Pending and past its backoff deadline.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        self.status == ItemStatus::Pending && self.not_before_ms <= now_ms
    }

    pub fn byte_size(&self) -> usize {
        self.payload.byte_size()
    }
}

/// Drain order: highest priority first, then oldest first.
pub fn queue_order(a: &SyncQueueItem, b: &SyncQueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
}

/// Sort into [`queue_order`], then let each document's items take the
/// slots they occupy in version order. A document's oldest queued
/// version is always the first of its items to be sent.
pub fn order_for_delivery(items: &mut [SyncQueueItem]) {
    items.sort_by(queue_order);
    let mut slots: HashMap<DocumentId, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        slots.entry(item.document_id).or_default().push(index);
    }
    for indices in slots.into_values().filter(|indices| indices.len() > 1) {
        let mut group: Vec<SyncQueueItem> = indices.iter().map(|&i| items[i].clone()).collect();
        group.sort_by_key(|item| item.payload.version);
        for (index, item) in indices.into_iter().zip(group) {
            items[index] = item;
        }
    }
}

/// Eviction victim: the oldest item at the lowest priority present among
/// those `eligible` allows.
pub fn eviction_candidate(
    items: &[SyncQueueItem],
    eligible: impl Fn(&SyncQueueItem) -> bool,
) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| eligible(item))
        .min_by(|(_, a), (_, b)| {
            a.priority
                .cmp(&b.priority)
                .then(a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use quire_core::DocumentType;

    pub(crate) fn payload(doc: DocumentId, version: u64) -> SavePayload {
        let codec = CompressionCodec::new(CodecConfig::for_testing());
        let document = Document::text(DocumentType::RichText, format!("v{version}"));
        SavePayload::from_document(&codec, doc, &document, version, None, "session").unwrap()
    }

    pub(crate) fn item(priority: Priority, enqueued_at_ms: u64) -> SyncQueueItem {
        SyncQueueItem::new(payload(DocumentId::new(), 1), priority, 3, enqueued_at_ms)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::Critical.weight(), 4);
        assert_eq!(Priority::Low.weight(), 1);
    }

    #[test]
    fn test_queue_order() {
        let mut items = vec![
            item(Priority::Low, 1),
            item(Priority::Critical, 3),
            item(Priority::Medium, 2),
            item(Priority::Critical, 2),
        ];
        items.sort_by(queue_order);

        let order: Vec<(Priority, u64)> =
            items.iter().map(|i| (i.priority, i.enqueued_at_ms)).collect();
        assert_eq!(
            order,
            vec![
                (Priority::Critical, 2),
                (Priority::Critical, 3),
                (Priority::Medium, 2),
                (Priority::Low, 1),
            ]
        );
    }

    #[test]
    fn test_delivery_order_keeps_versions_of_a_document() {
        let doc = DocumentId::new();
        let other = SyncQueueItem::new(payload(DocumentId::new(), 1), Priority::High, 3, 1);
        let older = SyncQueueItem::new(payload(doc, 1), Priority::Medium, 3, 2);
        let newer = SyncQueueItem::new(payload(doc, 2), Priority::Critical, 3, 3);
        let mut items = vec![older.clone(), other.clone(), newer.clone()];

        order_for_delivery(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        // The critical slot goes to the document's older version.
        assert_eq!(ids, vec![older.id.as_str(), other.id.as_str(), newer.id.as_str()]);
    }

    #[test]
    fn test_eviction_candidate_oldest_lowest() {
        let items = vec![
            item(Priority::Medium, 1),
            item(Priority::Low, 5),
            item(Priority::Low, 3),
        ];
        assert_eq!(eviction_candidate(&items, |_| true), Some(2));
        assert_eq!(
            eviction_candidate(&items, |i| i.priority == Priority::Medium),
            Some(0)
        );
        assert_eq!(eviction_candidate(&items, |_| false), None);
    }

    #[test]
    fn test_payload_document_roundtrip() {
        let codec = CompressionCodec::new(CodecConfig::for_testing());
        let doc = DocumentId::new();
        let document = Document::fields(DocumentType::RichText, [("title", "x")]);
        let payload = SavePayload::from_document(&codec, doc, &document, 4, Some(3), "s").unwrap();

        assert_eq!(payload.version, 4);
        assert_eq!(payload.base_version, Some(3));
        assert_eq!(payload.decode_document(&codec).unwrap(), document);
    }

    #[test]
    fn test_item_readiness() {
        let mut it = item(Priority::High, 100);
        assert!(it.is_ready(100));
        it.not_before_ms = 200;
        assert!(!it.is_ready(150));
        assert!(it.is_ready(200));
        it.status = ItemStatus::Conflict;
        assert!(!it.is_ready(500));
    }
}
