//! # quire-engine — Auto-save and sync engine for Quire documents
//!
//! Debounced saves, versioning, compression, an offline queue with
//! conflict resolution, batched delivery and performance monitoring.
//!
//! ## Architecture
//!
//! ```text
//!   editor ── trigger / force_save ──► ┌──────────────────┐
//!                                      │ SaveOrchestrator │──► SaveState listeners
//!                                      └───┬─────┬─────┬──┘
//!                  ┌───────────────────────┘     │     └──────────────┐
//!                  ▼                             ▼                    ▼
//!         ┌─────────────────┐          ┌──────────────────┐  ┌────────────────┐
//!         │ VersionLedger   │          │ CompressionCodec │  │ SaveTransport  │
//!         │ (per document)  │          │ lz4 / deflate    │  │ (HTTP, tests)  │
//!         └─────────────────┘          └──────────────────┘  └───────▲────────┘
//!                                                                    │
//!         ┌─────────────────┐  conflicts  ┌─────────────────┐        │
//!         │ BatchScheduler  │ ──────────► │ OfflineQueue    │ ───────┤
//!         │ (grouped sends) │ ────────────┼─────────────────┼────────┘
//!         └────────┬────────┘             └────────┬────────┘
//!                  └────────────┬──────────────────┘
//!                               ▼
//!              ┌──────────────────────────────────┐
//!              │ DurableStore · EmergencyBackup   │
//!              │ MetricRecorder (alerts, reports) │
//!              └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`] — Debounce, single-flight saves, state read model
//! - [`ledger`] — Bounded per-document version history
//! - [`codec`] — Adaptive compression with integrity hashes
//! - [`offline`] — Prioritized offline queue and conflict records
//! - [`batch`] — Size and byte bounded batches with bounded concurrency
//! - [`metrics`] — Samples, threshold alerts, periodic reports
//! - [`storage`] — Durable store, fallback records, emergency backups
//! - [`transport`] — Save wire types and transports
//! - [`runtime`] — Clock, scheduler and network seams

pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod item;
pub mod ledger;
pub mod listeners;
pub mod metrics;
pub mod offline;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use batch::{BatchConfig, BatchMetrics, BatchOutcome, BatchScheduler, BatchStatus};
pub use codec::{Algorithm, CodecConfig, CodecError, CompressedPayload, CompressionCodec};
pub use config::{ConfigError, EngineConfig};
pub use error::EngineError;
pub use item::{Priority, SavePayload, SyncQueueItem};
pub use ledger::{ContentVersion, IncrementalData, LedgerConfig, VersionLedger, VersionStats};
pub use listeners::SubscriptionId;
pub use metrics::{
    Alert, MetricRecorder, MetricsConfig, Operation, PerformanceReport, PerformanceSample,
    Severity,
};
pub use offline::{
    ConflictRecord, ConflictStrategy, DrainReport, OfflineConfig, OfflineMetrics, OfflineQueue,
    Resolution, ResolveStrategy,
};
pub use orchestrator::{
    ConflictStatus, OrchestratorConfig, SaveOrchestrator, SaveOutcome, SaveState, SaveStatus,
    Subscription, TriggerOutcome,
};
pub use retry::RetryPolicy;
pub use runtime::{
    Clock, ManualClock, ManualScheduler, NetworkMonitor, NetworkStatus, Scheduler, SystemClock,
    TokioScheduler,
};
pub use services::EngineDeps;
pub use storage::{
    BackupReason, BackupRecord, DurableStore, EmergencyBackup, FallbackRecord, MemoryStore,
    StoreError,
};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{
    ConflictData, SaveRequest, SaveResponse, SaveTransport, ScriptedTransport, TransportError,
};
