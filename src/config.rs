//! Broker configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// Where subscription records live.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local map; subscriptions do not survive a restart.
    Memory,
    /// One `<id>.sub` file per subscription under `path`.
    FileSystem { path: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Broker configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub storage: StorageConfig,

    /// Decoded records cached by the file store.
    /// Default: 1000
    pub store_cache_size: usize,

    /// Threads running `terminate()` callbacks.
    /// Default: 2
    pub scheduler_workers: usize,

    /// Threads running `filter_message` for submitted messages.
    /// Default: 2
    pub ingest_workers: usize,

    /// Messages buffered before `submit` blocks.
    /// Default: 1024
    pub ingest_queue_size: usize,

    /// First segment of synthesized AMQP topic names.
    pub amqp_base_prefix: String,

    /// Broker used when an AMQP delivery definition has an empty location.
    pub amqp_default_broker: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            store_cache_size: 1000,
            scheduler_workers: 2,
            ingest_workers: 2,
            ingest_queue_size: 1024,
            amqp_base_prefix: "herald".to_string(),
            amqp_default_broker: "localhost".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{"storage": {"kind": "file_system", "path": "/var/lib/herald"}, "scheduler_workers": 4}"#,
        )
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::FileSystem {
                path: PathBuf::from("/var/lib/herald")
            }
        );
        assert_eq!(config.scheduler_workers, 4);
        assert_eq!(config.ingest_queue_size, 1024);
        assert_eq!(config.amqp_base_prefix, "herald");
    }
}
