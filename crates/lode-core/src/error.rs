//! Error types for the Lode block store.
use thiserror::Error;

/// Failures of the key/value substrate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("failed to open storage engine at {path}: {reason}")] Open { path: String, reason: String },
    #[error("storage engine is closed")] Closed,
    #[error("{op} on bucket {bucket}: {reason}")] Backend { op: &'static str, bucket: String, reason: String },
    #[error("codec: {0}")] Codec(String),
    #[error("corrupt record in {bucket} at key {key}: {reason}")] Corrupt { bucket: String, key: String, reason: String },
    #[error("missing bucket: {0}")] MissingBucket(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("empty chain: no block to disconnect")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("chain linkage: block parent {got} does not match tip {expected}")] ChainLinkage { expected: String, got: String },
    #[error("parent of block {block} is unknown: {parent}")] MissingParent { block: String, parent: String },
    #[error("spend journal missing for block: {0}")] SpendJournalMissing(String),
    #[error("spend journal mismatch for block {block}: expected {expected} entries, got {got}")] SpendJournalMismatch { block: String, expected: usize, got: usize },
    #[error("spend journal for block {block} does not match input {outpoint}")] SpendJournalOrder { block: String, outpoint: String },
    #[error("block is marked invalid: {0}")] InvalidBlock(String),
    #[error("best-chain block {0} must stay valid")] TipStatus(String),
    #[error("unknown output spent: {0}")] MissingUtxo(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("{index} requires {requires} to exist")] Dependency { index: &'static str, requires: &'static str },
    #[error("{0} is not enabled")] NotEnabled(&'static str),
    #[error("transaction not indexed: {0}")] TxNotFound(String),
    #[error("{0} is behind the chain tip")] Behind(&'static str),
    #[error("{0} has an unfinished drop")] DropPending(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("database schema version {stored} is newer than supported version {supported}")] UnsupportedVersion { stored: u32, supported: u32 },
    #[error("migration {from} -> {to} failed: {reason}")] StepFailed { from: u32, to: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum LodeError {
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error(transparent)] Index(#[from] IndexError),
    #[error(transparent)] Upgrade(#[from] UpgradeError),
    #[error("interrupt requested")] Interrupted,
}

impl LodeError {
    /// Whether this error is an expected "absent" result of a query.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LodeError::ChainState(ChainStateError::BlockNotFound(_))
                | LodeError::Index(IndexError::TxNotFound(_))
        )
    }

    /// Whether this error is fatal at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LodeError::Storage(StorageError::Open { .. })
                | LodeError::Storage(StorageError::Corrupt { .. })
                | LodeError::Upgrade(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        let err: LodeError = ChainStateError::BlockNotFound("ab".into()).into();
        assert!(err.is_not_found());
        let err: LodeError = IndexError::TxNotFound("cd".into()).into();
        assert!(err.is_not_found());
        let err: LodeError = ChainStateError::EmptyChain.into();
        assert!(!err.is_not_found());
    }

    #[test]
    fn upgrade_errors_are_fatal() {
        let err: LodeError = UpgradeError::UnsupportedVersion { stored: 9, supported: 3 }.into();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "database schema version 9 is newer than supported version 3"
        );
    }

    #[test]
    fn dependency_error_message() {
        let err = IndexError::Dependency { index: "address index", requires: "transaction index" };
        assert_eq!(err.to_string(), "address index requires transaction index to exist");
    }
}
