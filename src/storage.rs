use rocksdb::{Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Ordered byte-key store with atomic batches. The chain db and the
/// state db are two independent instances of this.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn write_batch(&self, ops: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StorageError>;

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }
}

// -----------------------------------------------------------------------------
// In-memory store, for tests and single-process clusters
// -----------------------------------------------------------------------------
#[derive(Default)]
pub struct MemDb {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, ops: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StorageError> {
        let mut map = self.map.lock().unwrap();
        for (key, value) in ops {
            map.insert(key, value);
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// RocksDB store
// -----------------------------------------------------------------------------
pub struct RocksDb {
    db: DB,
}

impl RocksDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Database for RocksDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn write_batch(&self, ops: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for (key, value) in &ops {
            batch.put(key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdb_batch_is_visible() {
        let db = MemDb::new();
        db.write_batch(vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ])
        .unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(db.exists(b"b").unwrap());
        assert_eq!(db.get(b"c").unwrap(), None);
    }
}
