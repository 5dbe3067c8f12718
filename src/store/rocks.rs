//! RocksDB implementation of the store contract

use std::path::Path;

use log::error;
use rocksdb::{Options, WriteBatch, DB};

use super::{StoreBatch, StoreError, StoreResult, TreeStore};

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// RocksDB-backed store
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Open (or create) a database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        Self::open_with_options(path, opts)
    }

    /// Open a database with custom options
    pub fn open_with_options(path: &Path, options: Options) -> StoreResult<Self> {
        let db = DB::open(&options, path).map_err(|e| {
            error!("failed to open RocksDB at {}: {}", path.display(), e);
            StoreError::Backend(format!("failed to open RocksDB: {}", e))
        })?;
        Ok(Self { db })
    }
}

impl TreeStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.db.get(key)?.ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        Ok(self.db.put(key, value)?)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        Ok(self.db.delete(key)?)
    }

    fn new_batch(&self) -> Box<dyn StoreBatch + '_> {
        Box::new(RocksBatch {
            db: &self.db,
            inner: WriteBatch::default(),
        })
    }

    fn close(&self) -> StoreResult<()> {
        // The handle itself is released on drop; flushing here makes close
        // a durability point.
        Ok(self.db.flush()?)
    }
}

/// Batch against a [`RocksDbStore`], applied through a single
/// `rocksdb::WriteBatch`
struct RocksBatch<'a> {
    db: &'a DB,
    inner: WriteBatch,
}

impl StoreBatch for RocksBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.inner.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.inner.delete(key);
    }

    fn reset(&mut self) {
        self.inner.clear();
    }

    fn size(&self) -> usize {
        self.inner.size_in_bytes()
    }

    fn write(&mut self) -> StoreResult<()> {
        let batch = std::mem::take(&mut self.inner);
        Ok(self.db.write(batch)?)
    }
}
