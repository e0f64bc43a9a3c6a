//! # quire-core — content schema for the Quire sync engine
//!
//! Every activity the editor produces is a [`Document`]: a versioned,
//! typed envelope around a [`ContentBody`] whose shape decides how it is
//! diffed and merged.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Document                                     │
//! │   schema_version  doc_type  title            │
//! │   body ─┬─ Entities [ {id, fields}, ... ]    │
//! │         ├─ Fields   { key: value, ... }      │
//! │         └─ Text     "..."                    │
//! └──────────────────────────────────────────────┘
//!            │                     │
//!            ▼                     ▼
//!      diff::diff_documents   merge::three_way_merge
//! ```
//!
//! The crate is pure: no I/O, no clocks, no logging of payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod diff;
pub mod merge;

pub use diff::{diff_documents, diff_values, ChangeOp, ChangeRecord};
pub use merge::{
    three_way_merge, FieldCollisionPolicy, FieldConflict, MergeError, MergeOutcome, Tombstone,
};

/// Highest schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Opaque identifier of the activity being edited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of activity a document describes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    Quiz,
    MatchUp,
    Flashcards,
    RichText,
    Custom(String),
}

/// Content errors.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported schema version {found} (this build supports up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// A single keyed entity inside an entity-array body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Fields as a JSON object (used by diff and merge).
    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone().into_iter().collect())
    }
}

/// Shape discriminant for a [`ContentBody`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentShape {
    Entities,
    Fields,
    Text,
}

impl fmt::Display for ContentShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentShape::Entities => "entities",
            ContentShape::Fields => "fields",
            ContentShape::Text => "text",
        };
        f.write_str(name)
    }
}

/// Document body, tagged by shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "snake_case")]
pub enum ContentBody {
    /// Array of entities keyed by `id`.
    Entities(Vec<Entity>),
    /// Object content.
    Fields(BTreeMap<String, Value>),
    /// Scalar / text content.
    Text(String),
}

impl ContentBody {
    pub fn shape(&self) -> ContentShape {
        match self {
            ContentBody::Entities(_) => ContentShape::Entities,
            ContentBody::Fields(_) => ContentShape::Fields,
            ContentBody::Text(_) => ContentShape::Text,
        }
    }

    /// Empty body of the given shape.
    pub fn empty(shape: ContentShape) -> Self {
        match shape {
            ContentShape::Entities => ContentBody::Entities(Vec::new()),
            ContentShape::Fields => ContentBody::Fields(BTreeMap::new()),
            ContentShape::Text => ContentBody::Text(String::new()),
        }
    }
}

/// The unit of content the engine saves, versions and merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub schema_version: u32,
    pub doc_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: ContentBody,
}

impl Document {
    pub fn new(doc_type: DocumentType, body: ContentBody) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            doc_type,
            title: None,
            body,
        }
    }

    /// Entity-array document.
    pub fn entities(doc_type: DocumentType, entities: Vec<Entity>) -> Self {
        Self::new(doc_type, ContentBody::Entities(entities))
    }

    /// Object document built from `(key, value)` pairs.
    pub fn fields<K, V, I>(doc_type: DocumentType, fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(doc_type, ContentBody::Fields(map))
    }

    /// Text document.
    pub fn text(doc_type: DocumentType, text: impl Into<String>) -> Self {
        Self::new(doc_type, ContentBody::Text(text.into()))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn shape(&self) -> ContentShape {
        self.body.shape()
    }

    /// Look up an entity by id (entity-array bodies only).
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        match &self.body {
            ContentBody::Entities(items) => items.iter().find(|e| e.id == id),
            _ => None,
        }
    }

    /// Canonical JSON bytes. Maps are ordered, so equal documents always
    /// produce identical bytes (and identical hashes).
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, ContentError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate the schema version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ContentError> {
        let doc: Document = serde_json::from_slice(bytes)?;
        if doc.schema_version > SCHEMA_VERSION {
            return Err(ContentError::UnsupportedSchema {
                found: doc.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(doc)
    }

    /// Serialized size in bytes (0 if the document cannot be encoded).
    pub fn byte_size(&self) -> usize {
        self.to_canonical_json().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_json_roundtrip() {
        let doc = Document::entities(
            DocumentType::Quiz,
            vec![
                Entity::new("q1").with("question", "2+2?").with("answer", 4),
                Entity::new("q2").with("question", "Capital of France?"),
            ],
        )
        .with_title("Warmup");

        let bytes = doc.to_canonical_json().unwrap();
        let back = Document::from_json(&bytes).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.shape(), ContentShape::Entities);
        assert_eq!(back.entity("q1").unwrap().fields["answer"], json!(4));
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let a = Document::fields(DocumentType::RichText, [("b", "2"), ("a", "1")]);
        let b = Document::fields(DocumentType::RichText, [("a", "1"), ("b", "2")]);
        assert_eq!(a.to_canonical_json().unwrap(), b.to_canonical_json().unwrap());
    }

    #[test]
    fn test_future_schema_rejected() {
        let mut doc = Document::text(DocumentType::RichText, "hello");
        doc.schema_version = SCHEMA_VERSION + 1;
        let bytes = serde_json::to_vec(&doc).unwrap();
        match Document::from_json(&bytes) {
            Err(ContentError::UnsupportedSchema { found, .. }) => {
                assert_eq!(found, SCHEMA_VERSION + 1)
            }
            other => panic!("expected UnsupportedSchema, got {other:?}"),
        }
    }

    #[test]
    fn test_document_id_parse_display() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_custom_document_type_serde() {
        let doc = Document::text(DocumentType::Custom("crossword".into()), "x");
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["doc_type"], json!({ "custom": "crossword" }));
        assert_eq!(value["body"]["shape"], json!("text"));
    }

    #[test]
    fn test_entity_lookup_on_non_entity_body() {
        let doc = Document::text(DocumentType::RichText, "plain");
        assert!(doc.entity("anything").is_none());
        assert!(doc.byte_size() > 0);
    }
}
