//! Blob key-value store consumed by the Merkle tree and block store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

pub trait Db: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: &[u8]);
}

/// In-memory backend used by tests and tooling.
#[derive(Default)]
pub struct MemDb {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("memdb lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Db for MemDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().expect("memdb lock").get(key).cloned()
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.map
            .write()
            .expect("memdb lock")
            .insert(key.to_vec(), value.to_vec());
    }
}

/// Persistent RocksDB backend. Backend failures are fatal: a node that cannot
/// read or write its stores must not keep voting. A panic would only unwind
/// the calling thread and leave the rest of the process looking alive, so a
/// backend error logs diagnostics and exits the whole process.
pub struct RocksDb {
    db: rocksdb::DB,
}

impl RocksDb {
    pub fn open(path: &Path) -> Result<Self, rocksdb::Error> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Db for RocksDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.db.get(key) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "rocksdb read failed, halting node");
                std::process::exit(1);
            }
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        if let Err(e) = self.db.put(key, value) {
            tracing::error!(error = %e, "rocksdb write failed, halting node");
            std::process::exit(1);
        }
    }
}
