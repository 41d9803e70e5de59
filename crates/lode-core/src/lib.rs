//! # lode-core
//! Foundation types, error taxonomy and store traits for the Lode block store.

pub mod chain;
pub mod error;
pub mod genesis;
pub mod merkle;
pub mod traits;
pub mod types;
