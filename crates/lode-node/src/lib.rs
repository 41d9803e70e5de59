//! # lode-node: block store, indexes and lifecycle.
//!
//! - [`engine::Engine`]: transactional key/value engine over RocksDB
//! - [`storage::BlockStore`]: blocks, chain index, tip, spend journals, unspent set
//! - [`indexers::IndexManager`]: optional transaction and address indexes
//! - [`upgrade`]: schema versioning and migrations
//! - [`lifecycle::Coordinator`]: startup/shutdown ordering around the store
//! - [`db::ChainDb`]: the open store, implementing `ChainStore` and `IndexQuery`

pub mod config;
pub mod db;
pub mod engine;
pub mod indexers;
pub mod interrupt;
pub mod lifecycle;
pub mod storage;
pub mod upgrade;

pub use config::NodeConfig;
pub use db::ChainDb;
pub use interrupt::{Interrupt, InterruptSource};
pub use lifecycle::{Coordinator, RunOutcome, Service, TipReporter};
