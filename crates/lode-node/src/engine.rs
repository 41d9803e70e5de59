//! Transactional key/value engine over RocksDB.
//!
//! Every named bucket is a RocksDB column family. Work happens in units:
//!
//! - [`Engine::view`] runs a closure against a RocksDB snapshot, so it sees one
//!   stable committed state for its whole duration.
//! - [`Engine::update`] buffers writes in an overlay (reads inside the update
//!   see them) and commits them as a single synced [`WriteBatch`] only if the
//!   closure returns `Ok`. An error or a panic drops the overlay unwritten.
//!
//! Updates are serialized by a writer mutex. Views never wait for it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::{debug, info, warn};

use lode_core::error::{LodeError, StorageError};

/// Bucket (column family) names. These are on-disk identifiers.
pub mod bucket {
    pub const BLOCKS: &str = "blocks";
    pub const HEADERS: &str = "headers";
    pub const CHAIN_INDEX: &str = "chain_index";
    pub const HEIGHT_INDEX: &str = "height_index";
    pub const SPEND_JOURNAL: &str = "spend_journal";
    pub const UTXOS: &str = "utxos";
    pub const METADATA: &str = "metadata";
    pub const INDEX_META: &str = "index_meta";
    pub const TX_INDEX: &str = "tx_index";
    pub const ADDR_INDEX: &str = "addr_index";

    /// All buckets, created on open if missing.
    pub const ALL: &[&str] = &[
        BLOCKS,
        HEADERS,
        CHAIN_INDEX,
        HEIGHT_INDEX,
        SPEND_JOURNAL,
        UTXOS,
        METADATA,
        INDEX_META,
        TX_INDEX,
        ADDR_INDEX,
    ];
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// fsync the write-ahead log on every commit.
    pub sync_writes: bool,
    /// Create the database directory if it does not exist.
    pub create_if_missing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            create_if_missing: true,
        }
    }
}

/// Encode a stored record with the canonical bincode configuration.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Codec(e.to_string()))
}

/// Decode a stored record, naming its location on failure.
pub fn decode<T: bincode::Decode<()>>(bucket: &str, key: &[u8], bytes: &[u8]) -> Result<T, StorageError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StorageError::Corrupt {
            bucket: bucket.to_string(),
            key: hex::encode(key),
            reason: e.to_string(),
        })
}

fn backend(op: &'static str, bucket: &str, e: rocksdb::Error) -> StorageError {
    StorageError::Backend {
        op,
        bucket: bucket.to_string(),
        reason: e.to_string(),
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, StorageError> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::MissingBucket(name.to_string()))
}

/// Read access shared by views and updates.
pub trait ReadTx {
    /// Raw value under `key`.
    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LodeError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn prefix_scan(&self, bucket: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LodeError>;

    /// Whether the bucket holds no entries.
    fn bucket_is_empty(&self, bucket: &'static str) -> Result<bool, LodeError>;

    /// Decoded value under `key`.
    fn get_decoded<T: bincode::Decode<()>>(&self, bucket: &'static str, key: &[u8]) -> Result<Option<T>, LodeError> {
        match self.get(bucket, key)? {
            Some(bytes) => Ok(Some(decode(bucket, key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    fn contains(&self, bucket: &'static str, key: &[u8]) -> Result<bool, LodeError> {
        Ok(self.get(bucket, key)?.is_some())
    }
}

/// Handle to an open engine.
pub struct Engine {
    path: PathBuf,
    db: RwLock<Option<DB>>,
    writer: Mutex<()>,
    sync_writes: bool,
}

impl Engine {
    /// Open or create the engine at `path`.
    ///
    /// Fails with [`StorageError::Open`] when the directory is unreadable,
    /// corrupt, or locked by another process.
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(config.create_if_missing);
        db_opts.create_missing_column_families(true);

        // Open every bucket already on disk too, so a store written by a
        // newer release reaches the schema check instead of failing here.
        let mut names: Vec<String> = bucket::ALL.iter().map(|s| s.to_string()).collect();
        if let Ok(existing) = DB::list_cf(&db_opts, &path) {
            for name in existing {
                if name != rocksdb::DEFAULT_COLUMN_FAMILY_NAME && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        let descriptors: Vec<ColumnFamilyDescriptor> = names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &path, descriptors).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), buckets = names.len(), "storage engine opened");

        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
            writer: Mutex::new(()),
            sync_writes: config.sync_writes,
        })
    }

    /// Directory the engine was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.db.read_recursive().is_none()
    }

    /// Run a read-only unit of work against a stable snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&ViewTx<'_>) -> Result<T, LodeError>) -> Result<T, LodeError> {
        let guard = self.db.read_recursive();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;
        let view = ViewTx {
            db,
            snapshot: db.snapshot(),
        };
        f(&view)
    }

    /// Run a read-write unit of work. Its writes become visible atomically
    /// when `f` returns `Ok`, and are discarded otherwise.
    pub fn update<T>(&self, f: impl FnOnce(&mut UpdateTx<'_>) -> Result<T, LodeError>) -> Result<T, LodeError> {
        let _writer = self.writer.lock();
        let guard = self.db.read_recursive();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;
        let mut tx = UpdateTx {
            db,
            pending: BTreeMap::new(),
        };
        let value = f(&mut tx)?;
        tx.commit(self.sync_writes)?;
        Ok(value)
    }

    /// Every entry of every bucket, for diagnostics and byte-level comparisons.
    pub fn dump(&self) -> Result<Vec<(&'static str, Vec<(Vec<u8>, Vec<u8>)>)>, LodeError> {
        self.view(|v| {
            bucket::ALL
                .iter()
                .map(|name| Ok((*name, v.scan_bucket(*name)?)))
                .collect()
        })
    }

    /// Flush memtables and release the database. Safe to call more than once.
    pub fn close(&self) -> Result<(), LodeError> {
        let mut guard = self.db.write();
        let Some(db) = guard.take() else {
            return Ok(());
        };
        let flushed = db.flush();
        drop(db);
        match flushed {
            Ok(()) => {
                info!(path = %self.path.display(), "storage engine closed");
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), "flush on close failed: {e}");
                Err(backend("flush", "*", e).into())
            }
        }
    }
}

/// A read-only unit over one snapshot.
pub struct ViewTx<'a> {
    db: &'a DB,
    snapshot: rocksdb::Snapshot<'a>,
}

impl ViewTx<'_> {
    /// Every entry of a bucket, in key order.
    pub fn scan_bucket(&self, bucket: &'static str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LodeError> {
        self.prefix_scan(bucket, &[])
    }
}

impl ReadTx for ViewTx<'_> {
    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LodeError> {
        let handle = cf(self.db, bucket)?;
        Ok(self
            .snapshot
            .get_cf(handle, key)
            .map_err(|e| backend("get", bucket, e))?)
    }

    fn prefix_scan(&self, bucket: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LodeError> {
        let handle = cf(self.db, bucket)?;
        let iter = self
            .snapshot
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| backend("scan", bucket, e))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn bucket_is_empty(&self, bucket: &'static str) -> Result<bool, LodeError> {
        let handle = cf(self.db, bucket)?;
        match self.snapshot.iterator_cf(handle, IteratorMode::Start).next() {
            Some(item) => {
                item.map_err(|e| backend("scan", bucket, e))?;
                Ok(false)
            }
            None => Ok(true),
        }
    }
}

/// A read-write unit. Writes are buffered until commit.
pub struct UpdateTx<'a> {
    db: &'a DB,
    /// bucket -> key -> new value (`None` = delete).
    pending: BTreeMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl UpdateTx<'_> {
    /// Buffer a write.
    pub fn put(&mut self, bucket: &'static str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pending
            .entry(bucket)
            .or_default()
            .insert(key.into(), Some(value.into()));
    }

    /// Buffer an encoded write.
    pub fn put_encoded<T: bincode::Encode>(
        &mut self,
        bucket: &'static str,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<(), LodeError> {
        let bytes = encode(value)?;
        self.put(bucket, key, bytes);
        Ok(())
    }

    /// Buffer a delete.
    pub fn delete(&mut self, bucket: &'static str, key: impl Into<Vec<u8>>) {
        self.pending.entry(bucket).or_default().insert(key.into(), None);
    }

    /// Up to `limit` committed keys of `bucket` not already deleted in this
    /// update, in key order. Used to clear a bucket in bounded chunks.
    pub fn first_keys(&self, bucket: &'static str, limit: usize) -> Result<Vec<Vec<u8>>, LodeError> {
        let handle = cf(self.db, bucket)?;
        let overlay = self.pending.get(bucket);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = item.map_err(|e| backend("scan", bucket, e))?;
            let deleted = overlay
                .and_then(|o| o.get(key.as_ref()))
                .is_some_and(|v| v.is_none());
            if !deleted {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    /// Number of buffered writes and deletes.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    fn commit(self, sync: bool) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        let mut ops = 0usize;
        for (bucket, writes) in &self.pending {
            let handle = cf(self.db, bucket)?;
            for (key, value) in writes {
                match value {
                    Some(v) => batch.put_cf(handle, key, v),
                    None => batch.delete_cf(handle, key),
                }
                ops += 1;
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(sync);
        self.db
            .write_opt(batch, &opts)
            .map_err(|e| backend("commit", "*", e))?;
        debug!(ops, "update committed");
        Ok(())
    }
}

impl ReadTx for UpdateTx<'_> {
    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, LodeError> {
        if let Some(value) = self.pending.get(bucket).and_then(|o| o.get(key)) {
            return Ok(value.clone());
        }
        let handle = cf(self.db, bucket)?;
        Ok(self.db.get_cf(handle, key).map_err(|e| backend("get", bucket, e))?)
    }

    fn prefix_scan(&self, bucket: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, LodeError> {
        let handle = cf(self.db, bucket)?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| backend("scan", bucket, e))?;
            if !key.starts_with(prefix) {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }
        if let Some(overlay) = self.pending.get(bucket) {
            for (key, value) in overlay.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn bucket_is_empty(&self, bucket: &'static str) -> Result<bool, LodeError> {
        let overlay = self.pending.get(bucket);
        if overlay.is_some_and(|o| o.values().any(Option::is_some)) {
            return Ok(false);
        }
        let handle = cf(self.db, bucket)?;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| backend("scan", bucket, e))?;
            let deleted = overlay
                .and_then(|o| o.get(key.as_ref()))
                .is_some_and(|v| v.is_none());
            if !deleted {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
