//! Engine-wide configuration.
//!
//! Every section has its own `Default` and `for_testing()`; missing keys
//! in a JSON file fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::codec::CodecConfig;
use crate::ledger::LedgerConfig;
use crate::metrics::MetricsConfig;
use crate::offline::OfflineConfig;
use crate::orchestrator::OrchestratorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub codec: CodecConfig,
    pub ledger: LedgerConfig,
    pub offline: OfflineConfig,
    pub batch: BatchConfig,
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Short timers and small capacities.
    pub fn for_testing() -> Self {
        Self {
            orchestrator: OrchestratorConfig::for_testing(),
            codec: CodecConfig::for_testing(),
            ledger: LedgerConfig::for_testing(),
            offline: OfflineConfig::for_testing(),
            batch: BatchConfig::for_testing(),
            metrics: MetricsConfig::for_testing(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "orchestrator": { "debounce_ms": 500 }, "batch": { "max_batch_size": 7 } }"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.debounce_ms, 500);
        assert_eq!(config.batch.max_batch_size, 7);
        assert_eq!(config.batch.max_queue_size, BatchConfig::default().max_queue_size);
        assert_eq!(config.offline.max_queue_size, 100);
        assert_eq!(config.ledger.max_history, 50);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "offline": { "sync_interval_ms": 250 } }"#).unwrap();
        let config = EngineConfig::from_path(&path).unwrap();
        assert_eq!(config.offline.sync_interval_ms, 250);

        assert!(matches!(
            EngineConfig::from_path(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
