//! Schema versioning and migrations.
//!
//! The store records its layout version under `metadata/schema_version`
//! (big-endian u32). At startup [`upgrade`] brings an older store forward
//! one step at a time; every step is a single update that transforms the
//! data and bumps the version together, so a crash leaves the store at
//! either the old or the new version and the next run resumes from there.

use std::path::Path;

use tracing::{debug, info, warn};

use lode_core::chain::{BlockStatus, ChainIndexEntry, ChainTip, SpendJournal};
use lode_core::error::{ChainStateError, LodeError, StorageError, UpgradeError};
use lode_core::types::Hash256;

use crate::engine::{bucket, decode, Engine, ReadTx, UpdateTx};
use crate::interrupt::Interrupt;
use crate::storage::{read_hash_at, JournalRecord, META_CHAIN_TIP};

/// Layout version written by this release.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

pub const META_SCHEMA_VERSION: &[u8] = b"schema_version";

/// Database directory name under the data directory.
pub const DB_DIR: &str = "chaindata";

/// Database directory name used by early releases.
pub const LEGACY_DB_DIR: &str = "blocks_db";

/// Record layouts of older schema versions.
pub mod legacy {
    use lode_core::types::Hash256;

    /// Tip height, u64 little-endian (v1).
    pub const META_TIP_HEIGHT: &[u8] = b"tip_height";
    /// Tip block id, 32 bytes (v1).
    pub const META_TIP_HASH: &[u8] = b"tip_hash";

    /// Chain index entry before validation status was tracked (v1, v2).
    #[derive(bincode::Encode, bincode::Decode, Clone, Debug, PartialEq, Eq)]
    pub struct ChainIndexEntryV2 {
        pub height: u64,
        pub cumulative_work: u128,
        pub parent: Hash256,
    }
}

/// Result of applying one migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// The store was not at the step's `from` version; nothing was written.
    Skipped,
}

/// One `from -> from + 1` schema transformation.
pub struct Migration {
    pub from: u32,
    pub description: &'static str,
    apply: fn(&mut UpdateTx<'_>) -> Result<(), LodeError>,
}

impl Migration {
    pub fn to(&self) -> u32 {
        self.from + 1
    }
}

/// Registered migrations, in version order.
pub static MIGRATIONS: [Migration; 2] = [
    Migration {
        from: 1,
        description: "fold split tip keys into a single chain tip record",
        apply: fold_tip_keys,
    },
    Migration {
        from: 2,
        description: "track validation status in chain index entries and spend journals",
        apply: add_block_status,
    },
];

/// What [`upgrade`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Version found on disk; `None` for a fresh store.
    pub from: Option<u32>,
    pub to: u32,
    /// `from` versions of the steps applied.
    pub applied: Vec<u32>,
}

/// The recorded schema version, if any.
pub fn read_version(r: &impl ReadTx) -> Result<Option<u32>, LodeError> {
    match r.get(bucket::METADATA, META_SCHEMA_VERSION)? {
        Some(bytes) => {
            let arr: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StorageError::Corrupt {
                bucket: bucket::METADATA.to_string(),
                key: hex::encode(META_SCHEMA_VERSION),
                reason: format!("expected 4-byte version, got {} bytes", bytes.len()),
            })?;
            Ok(Some(u32::from_be_bytes(arr)))
        }
        None => Ok(None),
    }
}

fn write_version(u: &mut UpdateTx<'_>, version: u32) {
    u.put(bucket::METADATA, META_SCHEMA_VERSION, version.to_be_bytes());
}

/// Effective schema version: the recorded one, or 1 for a populated store
/// that predates version records. `None` means a fresh, empty store.
pub fn detect_version(r: &impl ReadTx) -> Result<Option<u32>, LodeError> {
    if let Some(version) = read_version(r)? {
        return Ok(Some(version));
    }
    for name in [bucket::BLOCKS, bucket::CHAIN_INDEX, bucket::METADATA] {
        if !r.bucket_is_empty(name)? {
            return Ok(Some(1));
        }
    }
    Ok(None)
}

/// Apply one migration if the store is exactly at its `from` version.
pub fn apply_step(engine: &Engine, step: &Migration) -> Result<StepOutcome, LodeError> {
    engine.update(|u| {
        if detect_version(&*u)? != Some(step.from) {
            return Ok(StepOutcome::Skipped);
        }
        (step.apply)(u).map_err(|e| match e {
            LodeError::Interrupted => e,
            other => UpgradeError::StepFailed {
                from: step.from,
                to: step.to(),
                reason: other.to_string(),
            }
            .into(),
        })?;
        write_version(u, step.to());
        Ok(StepOutcome::Applied)
    })
}

/// Bring the store to [`CURRENT_SCHEMA_VERSION`].
///
/// A store already at the current version is left byte-for-byte untouched.
///
/// # Errors
///
/// - [`UpgradeError::UnsupportedVersion`] for a store written by a newer release
/// - [`UpgradeError::StepFailed`] if a migration fails
/// - [`LodeError::Interrupted`] if shutdown is requested between steps
pub fn upgrade(engine: &Engine, interrupt: &Interrupt) -> Result<UpgradeReport, LodeError> {
    let found = engine.view(|v| detect_version(v))?;
    let Some(mut version) = found else {
        engine.update(|u| {
            write_version(u, CURRENT_SCHEMA_VERSION);
            Ok(())
        })?;
        info!(version = CURRENT_SCHEMA_VERSION, "initialized fresh database");
        return Ok(UpgradeReport {
            from: None,
            to: CURRENT_SCHEMA_VERSION,
            applied: Vec::new(),
        });
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(UpgradeError::UnsupportedVersion {
            stored: version,
            supported: CURRENT_SCHEMA_VERSION,
        }
        .into());
    }
    if version == CURRENT_SCHEMA_VERSION {
        debug!(version, "database schema is current");
        return Ok(UpgradeReport {
            from: found,
            to: version,
            applied: Vec::new(),
        });
    }

    info!(from = version, to = CURRENT_SCHEMA_VERSION, "upgrading database schema");
    let mut applied = Vec::new();
    while version < CURRENT_SCHEMA_VERSION {
        interrupt.check()?;
        let step = MIGRATIONS
            .iter()
            .find(|m| m.from == version)
            .ok_or_else(|| UpgradeError::StepFailed {
                from: version,
                to: version + 1,
                reason: "no migration registered".into(),
            })?;
        if apply_step(engine, step)? == StepOutcome::Applied {
            info!(from = step.from, to = step.to(), "{}", step.description);
            applied.push(step.from);
        }
        version = engine
            .view(|v| detect_version(v))?
            .unwrap_or(CURRENT_SCHEMA_VERSION);
    }
    Ok(UpgradeReport {
        from: found,
        to: version,
        applied,
    })
}

/// Move a database left under [`LEGACY_DB_DIR`] to [`DB_DIR`]. Returns
/// whether anything was moved.
pub fn upgrade_data_paths(data_dir: &Path) -> Result<bool, LodeError> {
    let legacy = data_dir.join(LEGACY_DB_DIR);
    let current = data_dir.join(DB_DIR);
    if !legacy.is_dir() {
        return Ok(false);
    }
    if current.exists() {
        warn!(legacy = %legacy.display(), "legacy database directory left in place; {} already exists", current.display());
        return Ok(false);
    }
    std::fs::rename(&legacy, &current).map_err(|e| StorageError::Open {
        path: legacy.display().to_string(),
        reason: format!("moving to {}: {e}", current.display()),
    })?;
    info!(from = %legacy.display(), to = %current.display(), "moved database directory");
    Ok(true)
}

// --- Steps ---

fn corrupt(bucket: &str, key: &[u8], reason: &str) -> StorageError {
    StorageError::Corrupt {
        bucket: bucket.to_string(),
        key: hex::encode(key),
        reason: reason.to_string(),
    }
}

/// v1 -> v2: `tip_height` + `tip_hash` become one [`ChainTip`] record.
fn fold_tip_keys(u: &mut UpdateTx<'_>) -> Result<(), LodeError> {
    let tip_hash = u.get(bucket::METADATA, legacy::META_TIP_HASH)?;
    let tip_height = u.get(bucket::METADATA, legacy::META_TIP_HEIGHT)?;
    u.delete(bucket::METADATA, legacy::META_TIP_HASH);
    u.delete(bucket::METADATA, legacy::META_TIP_HEIGHT);

    let Some(bytes) = tip_hash else {
        return Ok(());
    };
    let hash = Hash256::from_slice(&bytes)
        .ok_or_else(|| corrupt(bucket::METADATA, legacy::META_TIP_HASH, "expected 32-byte block id"))?;
    // A zero tip hash is how v1 recorded an empty chain.
    if hash.is_zero() {
        return Ok(());
    }
    let entry: legacy::ChainIndexEntryV2 = u
        .get_decoded(bucket::CHAIN_INDEX, hash.as_ref())?
        .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
    if let Some(height) = tip_height {
        let recorded = <[u8; 8]>::try_from(height.as_slice())
            .map(u64::from_le_bytes)
            .map_err(|_| corrupt(bucket::METADATA, legacy::META_TIP_HEIGHT, "expected 8-byte height"))?;
        if recorded != entry.height {
            return Err(corrupt(
                bucket::METADATA,
                legacy::META_TIP_HEIGHT,
                &format!("tip height {recorded} disagrees with chain index height {}", entry.height),
            )
            .into());
        }
    }
    let tip = ChainTip {
        hash,
        height: entry.height,
        cumulative_work: entry.cumulative_work,
    };
    u.put_encoded(bucket::METADATA, META_CHAIN_TIP, &tip)
}

/// v2 -> v3: chain index entries gain a status (`Valid` on the best chain,
/// `Unknown` elsewhere) and spend journals record the prior status of their
/// block, which was `Unknown` for everything connected before v3.
fn add_block_status(u: &mut UpdateTx<'_>) -> Result<(), LodeError> {
    for (key, value) in u.prefix_scan(bucket::CHAIN_INDEX, &[])? {
        let old: legacy::ChainIndexEntryV2 = decode(bucket::CHAIN_INDEX, &key, &value)?;
        let hash = Hash256::from_slice(&key)
            .ok_or_else(|| corrupt(bucket::CHAIN_INDEX, &key, "expected 32-byte block id"))?;
        let status = if read_hash_at(&*u, old.height)? == Some(hash) {
            BlockStatus::Valid
        } else {
            BlockStatus::Unknown
        };
        let entry = ChainIndexEntry {
            height: old.height,
            cumulative_work: old.cumulative_work,
            status,
            parent: old.parent,
        };
        u.put_encoded(bucket::CHAIN_INDEX, key, &entry)?;
    }

    for (key, value) in u.prefix_scan(bucket::SPEND_JOURNAL, &[])? {
        let journal: SpendJournal = decode(bucket::SPEND_JOURNAL, &key, &value)?;
        let record = JournalRecord {
            prior_status: BlockStatus::Unknown,
            journal,
        };
        u.put_encoded(bucket::SPEND_JOURNAL, key, &record)?;
    }
    Ok(())
}
