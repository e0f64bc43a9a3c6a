//! In-process stand-in for the save endpoint.
//!
//! Accepts a save whose base matches the stored version, answers a stale
//! base with the conflict payload, and fails a share of requests with
//! transient errors. A simulated collaborator can edit the stored copy.

use async_trait::async_trait;
use log::{debug, warn};
use quire_core::{ContentBody, Document, DocumentId, DocumentType, Entity};
use quire_engine::{
    CompressionCodec, ConflictData, SaveRequest, SaveResponse, SaveTransport, TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerStats {
    pub accepted: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub remote_edits: u64,
}

#[derive(Default)]
struct StoredDoc {
    version: u64,
    history: BTreeMap<u64, Document>,
}

impl StoredDoc {
    fn current(&self) -> Option<&Document> {
        self.history.get(&self.version)
    }

    fn store(&mut self, content: Document) -> u64 {
        self.version += 1;
        self.history.insert(self.version, content);
        self.version
    }
}

struct ServerState {
    rng: StdRng,
    docs: HashMap<DocumentId, StoredDoc>,
    stats: ServerStats,
}

pub struct FlakyServer {
    codec: CompressionCodec,
    failure_rate: f64,
    latency: Duration,
    state: Mutex<ServerState>,
}

impl FlakyServer {
    pub fn new(failure_rate: f64, latency: Duration, seed: u64) -> Self {
        Self {
            codec: CompressionCodec::default(),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            state: Mutex::new(ServerState {
                rng: StdRng::seed_from_u64(seed),
                docs: HashMap::new(),
                stats: ServerStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.lock().stats
    }

    /// A collaborator adds an entity to the stored copy of `doc`.
    pub fn remote_edit(&self, doc: DocumentId, tag: usize) {
        let mut state = self.lock();
        let Some(stored) = state.docs.get_mut(&doc) else {
            return;
        };
        let Some(current) = stored.current().cloned() else {
            return;
        };
        let mut edited = current;
        if let ContentBody::Entities(items) = &mut edited.body {
            items.push(
                Entity::new(format!("remote-{tag}")).with("question", "Added by a collaborator"),
            );
        }
        let version = stored.store(edited);
        state.stats.remote_edits += 1;
        debug!("collaborator edited {doc}, server now at v{version}");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decode(&self, request: &SaveRequest) -> Result<Document, TransportError> {
        let bytes = self
            .codec
            .decompress(&request.body, request.algorithm, &request.content_hash)
            .map_err(|e| TransportError::Permanent {
                status: Some(400),
                message: e.to_string(),
            })?;
        Document::from_json(&bytes).map_err(|e| TransportError::Permanent {
            status: Some(422),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SaveTransport for FlakyServer {
    async fn send(&self, request: &SaveRequest) -> Result<SaveResponse, TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let content = self.decode(request)?;

        let mut state = self.lock();
        if state.rng.gen_bool(self.failure_rate) {
            state.stats.failures += 1;
            warn!("server dropped save of {} v{}", request.document_id, request.version);
            return Err(TransportError::from_status(503, "Service Unavailable"));
        }

        let stored = state.docs.entry(request.document_id).or_default();
        let stale = stored.version > 0 && request.base_version != Some(stored.version);
        if stale {
            let server_version = stored
                .current()
                .cloned()
                .unwrap_or_else(|| Document::entities(DocumentType::Quiz, Vec::new()));
            let data = ConflictData {
                base_version: request
                    .base_version
                    .and_then(|base| stored.history.get(&base).cloned()),
                server_version,
            };
            let current = stored.version;
            state.stats.conflicts += 1;
            return Ok(SaveResponse::conflict(data, Some(current)));
        }

        let version = stored.store(content);
        state.stats.accepted += 1;
        Ok(SaveResponse::accepted(version))
    }
}
