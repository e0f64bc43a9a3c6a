//! Explicit dependency wiring.
//!
//! The engine owns no globals: callers hand in an [`EngineDeps`] and every
//! component receives the [`Services`] it needs.

use std::sync::Arc;

use crate::codec::{CodecConfig, CompressionCodec};
use crate::item::SyncQueueItem;
use crate::metrics::{MetricRecorder, MetricsConfig, Operation};
use crate::runtime::{Clock, NetworkMonitor, Scheduler};
use crate::storage::{BackupReason, DurableStore, EmergencyBackup};
use crate::transport::SaveTransport;

/// What the host application provides.
#[derive(Clone)]
pub struct EngineDeps {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    pub store: Arc<dyn DurableStore>,
    pub transport: Arc<dyn SaveTransport>,
}

/// Shared collaborators of the queues and the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn DurableStore>,
    pub transport: Arc<dyn SaveTransport>,
    pub codec: Arc<CompressionCodec>,
    pub metrics: Arc<MetricRecorder>,
    pub backup: Arc<EmergencyBackup>,
    pub network: Arc<NetworkMonitor>,
}

impl Services {
    pub fn new(
        deps: &EngineDeps,
        codec: CodecConfig,
        metrics: MetricsConfig,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            clock: Arc::clone(&deps.clock),
            store: Arc::clone(&deps.store),
            transport: Arc::clone(&deps.transport),
            codec: Arc::new(CompressionCodec::new(codec)),
            metrics: Arc::new(MetricRecorder::new(metrics, Arc::clone(&deps.clock))),
            backup: Arc::new(EmergencyBackup::new(
                Arc::clone(&deps.store),
                Arc::clone(&deps.clock),
            )),
            network,
        }
    }

    /// Move an undelivered item into the emergency backup. A failed write
    /// raises a critical alert; returns whether the item was kept.
    pub fn preserve(&self, operation: Operation, item: &SyncQueueItem, reason: BackupReason) -> bool {
        match self.backup.preserve(item, reason) {
            Ok(_) => true,
            Err(e) => {
                self.metrics.raise_critical(
                    operation,
                    format!(
                        "Save for document {} left the queue ({reason:?}) and could not be backed up: {e}",
                        item.document_id
                    ),
                    item.retry_count as f64,
                    Some("Copy your changes before closing".to_string()),
                );
                false
            }
        }
    }
}
