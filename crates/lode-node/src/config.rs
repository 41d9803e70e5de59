//! Node configuration.
//!
//! [`NodeConfig`] carries the data directory, which optional indexes to keep,
//! the one-shot maintenance drops, and engine tuning. The binary fills it
//! from command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::indexers::IndexKind;
use crate::upgrade::DB_DIR;

/// Configuration for a node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Keep a transaction index.
    pub tx_index: bool,
    /// Keep an address index. Implies `tx_index`.
    pub addr_index: bool,
    /// Drop the transaction index (and the address index) and exit.
    pub drop_tx_index: bool,
    /// Drop the address index and exit.
    pub drop_addr_index: bool,
    /// Log level filter string (e.g. "info", "debug", "lode_node_lib=trace").
    pub log_level: String,
    /// Storage engine tuning.
    pub engine: EngineConfig,
    /// How often the tip reporter logs the best tip.
    pub tip_report_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lode");

        Self {
            data_dir,
            tx_index: false,
            addr_index: false,
            drop_tx_index: false,
            drop_addr_index: false,
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
            tip_report_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_DIR)
    }

    /// Indexes to keep, dependencies first.
    pub fn enabled_indexes(&self) -> Vec<IndexKind> {
        IndexKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                IndexKind::TxIndex => self.tx_index || self.addr_index,
                IndexKind::AddrIndex => self.addr_index,
            })
            .collect()
    }

    /// The index a maintenance run should drop, if one was requested.
    /// Dropping the transaction index also drops everything depending on it.
    pub fn maintenance_drop(&self) -> Option<IndexKind> {
        if self.drop_tx_index {
            Some(IndexKind::TxIndex)
        } else if self.drop_addr_index {
            Some(IndexKind::AddrIndex)
        } else {
            None
        }
    }
}
