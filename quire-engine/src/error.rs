//! Engine error taxonomy.
//!
//! Module errors convert into [`EngineError`]; the orchestrator is the
//! boundary where every variant becomes a `SaveState` or an `Alert`.

use quire_core::{ContentError, MergeError};
use thiserror::Error;

use crate::codec::CodecError;
use crate::storage::StoreError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network unavailable: {0}")]
    TransientNetwork(String),
    #[error("save rejected: {0}")]
    PermanentNetwork(String),
    #[error("compression failed: {0}")]
    CompressionFailure(String),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("conflict detected for item {item_id}")]
    ConflictDetected { item_id: String },
    #[error("queue full ({capacity} items) and nothing evictable")]
    QueueOverflow { capacity: usize },
    #[error("item {item_id} failed after {retries} retries")]
    MaxRetriesExceeded { item_id: String, retries: u32 },
    #[error("data loss: item {item_id} could not be delivered")]
    DataLoss { item_id: String },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("unknown conflict {0}")]
    UnknownConflict(String),
    #[error("engine closed")]
    Closed,
}

impl EngineError {
    /// Worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientNetwork(_))
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::IntegrityMismatch { expected, actual } => {
                EngineError::IntegrityMismatch { expected, actual }
            }
            other => EngineError::CompressionFailure(other.to_string()),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Transient(msg) => EngineError::TransientNetwork(msg),
            other => EngineError::PermanentNetwork(other.to_string()),
        }
    }
}

impl From<ContentError> for EngineError {
    fn from(e: ContentError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let transient: EngineError = TransportError::Transient("timeout".into()).into();
        assert!(transient.is_retryable());

        let permanent: EngineError = TransportError::from_status(422, "bad body").into();
        assert!(matches!(permanent, EngineError::PermanentNetwork(_)));
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_codec_integrity_maps_through() {
        let err: EngineError = CodecError::IntegrityMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(matches!(err, EngineError::IntegrityMismatch { .. }));

        let err: EngineError = CodecError::DecompressionFailed("bad".into()).into();
        assert!(matches!(err, EngineError::CompressionFailure(_)));
    }
}
