//! Save transport: the single network seam of the engine.
//!
//! ```text
//! SavePayload ──► SaveRequest ──► dyn SaveTransport ──► SaveResponse
//!                                   │
//!                                   ├─ HttpTransport     (reqwest, feature `http`)
//!                                   └─ ScriptedTransport (tests, simulations)
//! ```
//!
//! Errors are classified once, here: timeouts, 408, 429 and 5xx are
//! transient and retried; other statuses are permanent.

use async_trait::async_trait;
use log::trace;
use quire_core::{Document, DocumentId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::codec::Algorithm;
use crate::item::{Priority, SavePayload};

/// Everything the save endpoint receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub document_id: DocumentId,
    pub item_id: Option<String>,
    pub algorithm: Algorithm,
    pub compression_ratio: f64,
    pub content_hash: String,
    pub session_id: String,
    pub version: u64,
    pub base_version: Option<u64>,
    pub priority: Priority,
    pub body: Vec<u8>,
}

impl SaveRequest {
    pub fn from_payload(payload: &SavePayload, item_id: Option<&str>, priority: Priority) -> Self {
        Self {
            document_id: payload.document_id,
            item_id: item_id.map(str::to_string),
            algorithm: payload.algorithm,
            compression_ratio: payload.ratio,
            content_hash: payload.content_hash.clone(),
            session_id: payload.session_id.clone(),
            version: payload.version,
            base_version: payload.base_version,
            priority,
            body: payload.body.clone(),
        }
    }
}

/// Server-side view of a stale save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    #[serde(default)]
    pub base_version: Option<Document>,
    pub server_version: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    #[serde(default)]
    pub conflict_detected: bool,
    #[serde(default)]
    pub conflict_data: Option<ConflictData>,
    #[serde(default)]
    pub server_version_number: Option<u64>,
}

impl SaveResponse {
    pub fn accepted(server_version_number: u64) -> Self {
        Self {
            conflict_detected: false,
            conflict_data: None,
            server_version_number: Some(server_version_number),
        }
    }

    pub fn conflict(data: ConflictData, server_version_number: Option<u64>) -> Self {
        Self {
            conflict_detected: true,
            conflict_data: Some(data),
            server_version_number,
        }
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent (status {status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_status(status) {
            TransportError::Transient(format!("status {status}: {message}"))
        } else {
            TransportError::Permanent {
                status: Some(status),
                message,
            }
        }
    }
}

/// 408, 429 and every 5xx are worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[async_trait]
pub trait SaveTransport: Send + Sync {
    async fn send(&self, request: &SaveRequest) -> Result<SaveResponse, TransportError>;
}

// ─── HTTP ─────────────────────────────────────────────────────────────────

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use log::debug;

    /// POSTs to `{base_url}/api/universal-content/{doc}/enhanced-autosave`.
    pub struct HttpTransport {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpTransport {
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Permanent {
                    status: None,
                    message: e.to_string(),
                })?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }

        pub fn endpoint(&self, doc: DocumentId) -> String {
            format!(
                "{}/api/universal-content/{doc}/enhanced-autosave",
                self.base_url
            )
        }
    }

    #[async_trait]
    impl SaveTransport for HttpTransport {
        async fn send(&self, request: &SaveRequest) -> Result<SaveResponse, TransportError> {
            let mut builder = self
                .client
                .post(self.endpoint(request.document_id))
                .header("Content-Type", "application/octet-stream")
                .header("X-Compression-Algorithm", request.algorithm.as_str())
                .header(
                    "X-Compression-Ratio",
                    format!("{:.4}", request.compression_ratio),
                )
                .header("X-Content-Hash", request.content_hash.as_str())
                .header("X-Session-Id", request.session_id.as_str())
                .header("X-Content-Version", request.version.to_string())
                .header("X-Priority", request.priority.as_str());
            if let Some(base) = request.base_version {
                builder = builder.header("X-Base-Version", base.to_string());
            }
            if let Some(item_id) = &request.item_id {
                builder = builder.header("X-Sync-Queue-Item", item_id.as_str());
            }

            let response = builder
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| TransportError::Transient(e.to_string()))?;

            let status = response.status();
            debug!(
                "save {} v{} -> {status}",
                request.document_id, request.version
            );
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(TransportError::from_status(status.as_u16(), text));
            }

            response
                .json::<SaveResponse>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()))
        }
    }
}

// ─── Scripted ─────────────────────────────────────────────────────────────

/// Transport that replays scripted results and records every request.
///
/// When the script runs out, requests succeed with an incrementing
/// server version number.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<SaveResponse, TransportError>>>,
    requests: Mutex<Vec<SaveRequest>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long (tokio time) before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&self, result: Result<SaveResponse, TransportError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn push_failures(&self, count: usize, error: TransportError) {
        for _ in 0..count {
            self.push(Err(error.clone()));
        }
    }

    pub fn requests(&self) -> Vec<SaveRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SaveTransport for ScriptedTransport {
    async fn send(&self, request: &SaveRequest) -> Result<SaveResponse, TransportError> {
        let served = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.push(request.clone());
            requests.len() as u64
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        trace!("scripted transport answering request #{served}");
        scripted.unwrap_or_else(|| Ok(SaveResponse::accepted(served)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::tests::payload;
    use quire_core::DocumentType;

    #[test]
    fn test_status_classification() {
        assert!(is_transient_status(408));
        assert!(is_transient_status(429));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(409));
        assert!(TransportError::from_status(500, "boom").is_retryable());
        assert!(!TransportError::from_status(403, "nope").is_retryable());
    }

    #[test]
    fn test_request_from_payload() {
        let doc = DocumentId::new();
        let payload = payload(doc, 5);
        let request = SaveRequest::from_payload(&payload, Some("item-1"), Priority::High);

        assert_eq!(request.document_id, doc);
        assert_eq!(request.version, 5);
        assert_eq!(request.item_id.as_deref(), Some("item-1"));
        assert_eq!(request.content_hash, payload.content_hash);
        assert_eq!(request.body, payload.body);
    }

    #[test]
    fn test_response_json_defaults() {
        let response: SaveResponse = serde_json::from_str("{}").unwrap();
        assert!(!response.conflict_detected);
        assert!(response.conflict_data.is_none());

        let server = Document::text(DocumentType::RichText, "server");
        let json = serde_json::to_string(&SaveResponse::conflict(
            ConflictData {
                base_version: None,
                server_version: server.clone(),
            },
            Some(9),
        ))
        .unwrap();
        let back: SaveResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.conflict_data.unwrap().server_version, server);
    }

    #[tokio::test]
    async fn test_scripted_transport() {
        let transport = ScriptedTransport::new();
        transport.push(Err(TransportError::Transient("down".into())));
        let request = SaveRequest::from_payload(&payload(DocumentId::new(), 1), None, Priority::Low);

        assert!(transport.send(&request).await.is_err());
        let ok = transport.send(&request).await.unwrap();
        assert_eq!(ok.server_version_number, Some(2));
        assert_eq!(transport.request_count(), 2);
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_endpoint() {
        let transport = HttpTransport::new("https://example.test/", Duration::from_secs(5)).unwrap();
        let doc = DocumentId::new();
        assert_eq!(
            transport.endpoint(doc),
            format!("https://example.test/api/universal-content/{doc}/enhanced-autosave")
        );
    }
}
