//! End-to-end test suite for the Lode block store.
//!
//! Scenarios drive a real RocksDB-backed [`lode_node_lib::ChainDb`] through
//! chain extension, reorganizations, index maintenance, schema upgrades and
//! the startup/shutdown sequence.

pub mod helpers;
