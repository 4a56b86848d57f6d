use std::sync::Arc;

use crate::db::Db;
use crate::merkle::node::{IavlNode, TreeError};
use crate::types::Hash;

/// Versioned, hash-authenticated key-value tree over a blob store.
///
/// Single-writer: all mutation happens on the owning task. A snapshot loaded
/// by root hash only ever reads persisted nodes and is safe to share.
pub struct IavlTree {
    db: Arc<dyn Db>,
    root: Option<Box<IavlNode>>,
}

impl Clone for IavlTree {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            root: self.root.clone(),
        }
    }
}

impl std::fmt::Debug for IavlTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IavlTree").field("size", &self.size()).finish()
    }
}

impl IavlTree {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db, root: None }
    }

    /// Materialize a tree rooted at `root_hash`. The root placeholder is
    /// loaded eagerly; descendants load lazily on first descent.
    pub fn load(db: Arc<dyn Db>, root_hash: Hash) -> Result<Self, TreeError> {
        if root_hash.is_zero() {
            return Ok(Self::new(db));
        }
        let root = IavlNode::load(&db, root_hash)?;
        Ok(Self {
            db,
            root: Some(Box::new(root)),
        })
    }

    pub fn size(&self) -> u64 {
        self.root.as_ref().map(|r| r.size).unwrap_or(0)
    }

    pub fn height(&self) -> u8 {
        self.root.as_ref().map(|r| r.height).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        match &self.root {
            None => Ok(None),
            Some(root) => root.get(&self.db, key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace. Returns whether the key already existed.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        match self.root.take() {
            None => {
                self.root = Some(Box::new(IavlNode::new_leaf(key.to_vec(), value.to_vec())));
                Ok(false)
            }
            Some(root) => {
                let (new_root, updated) = root.set(&self.db, key, value)?;
                self.root = Some(new_root);
                Ok(updated)
            }
        }
    }

    /// Remove a key, returning its value. Fails with `NotFound` when absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<Vec<u8>, TreeError> {
        // The descent consumes nodes, so confirm presence before mutating.
        if !self.has(key)? {
            return Err(TreeError::NotFound);
        }
        let root = self.root.take().expect("non-empty after has()");
        let (new_root, _, value) = root.remove(&self.db, key)?;
        self.root = new_root;
        Ok(value)
    }

    /// Root hash and the number of nodes hashed by this call.
    /// The empty tree hashes to the zero hash.
    pub fn hash(&mut self) -> (Hash, u64) {
        match &mut self.root {
            None => (Hash::ZERO, 0),
            Some(root) => {
                let mut count = 0u64;
                let h = root.hash_with_count(&mut count);
                (h, count)
            }
        }
    }

    /// Idempotently persist every unpersisted node, returning the root hash.
    pub fn save(&mut self) -> Hash {
        match &mut self.root {
            None => Hash::ZERO,
            Some(root) => root.save(&self.db),
        }
    }
}
