//! Lode node binary.
//!
//! Opens (and upgrades) the chain database, keeps the configured indexes
//! current, and runs until Ctrl+C. The `--drop-*` flags run a one-shot
//! index removal instead.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lode_node_lib::interrupt;
use lode_node_lib::{Coordinator, NodeConfig, RunOutcome, Service, TipReporter};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lode-node",
    version,
    about = "Block store and index node backed by RocksDB"
)]
struct Args {
    /// Data directory for the chain database
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Maintain a transaction index (txid to block location)
    #[arg(long)]
    txindex: bool,

    /// Maintain an address index. Enables --txindex.
    #[arg(long)]
    addrindex: bool,

    /// Delete the transaction index and every index that depends on it, then exit
    #[arg(long, conflicts_with_all = ["txindex", "addrindex"])]
    drop_txindex: bool,

    /// Delete the address index, then exit
    #[arg(long, conflicts_with = "addrindex")]
    drop_addrindex: bool,

    /// Seconds between best-tip log lines
    #[arg(long, default_value_t = 60)]
    tip_report_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> (NodeConfig, String) {
        let defaults = NodeConfig::default();
        let config = NodeConfig {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir.clone()),
            tx_index: self.txindex,
            addr_index: self.addrindex,
            drop_tx_index: self.drop_txindex,
            drop_addr_index: self.drop_addrindex,
            log_level: self.log_level,
            tip_report_interval: Duration::from_secs(self.tip_report_secs),
            ..defaults
        };
        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() {
    let (config, log_format) = Args::parse().into_config();
    init_logging(&config.log_level, &log_format);

    info!("Lode node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("indexes: {:?}", config.enabled_indexes());

    match run(config).await {
        Ok(RunOutcome::Completed) => info!("Lode node shutdown complete"),
        Ok(RunOutcome::Maintenance) => info!("index maintenance complete"),
        Ok(RunOutcome::Interrupted) => warn!("interrupted before startup finished"),
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<RunOutcome> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {}", config.data_dir.display()))?;

    let (source, interrupt) = interrupt::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down..."),
            Err(e) => error!("failed to listen for Ctrl+C: {e}"),
        }
        source.request();
    });

    let interval = config.tip_report_interval;
    let outcome = Coordinator::new(config, interrupt)
        .run(|db| {
            let services: Vec<Box<dyn Service>> = vec![Box::new(TipReporter::new(Arc::clone(&db), interval))];
            Ok(services)
        })
        .await
        .context("node stopped with an error")?;
    Ok(outcome)
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` emits one JSON object per line; anything else is
/// human-readable text. `RUST_LOG` overrides `level_str` when set.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_config() {
        let args = Args::parse_from(["lode-node", "--data-dir", "/tmp/x", "--addrindex", "--log-format", "json"]);
        let (config, format) = args.into_config();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert!(config.addr_index);
        assert_eq!(format, "json");
        assert_eq!(config.maintenance_drop(), None);
    }

    #[test]
    fn drop_conflicts_with_enabling() {
        assert!(Args::try_parse_from(["lode-node", "--drop-txindex", "--txindex"]).is_err());
        let args = Args::parse_from(["lode-node", "--drop-addrindex"]);
        let (config, _) = args.into_config();
        assert_eq!(
            config.maintenance_drop(),
            Some(lode_node_lib::indexers::IndexKind::AddrIndex)
        );
    }
}
