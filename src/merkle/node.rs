//! IAVL+ node: a self-balancing AVL variant with values only at leaves.
//!
//! Inner nodes carry the smallest key of their right subtree. Mutation clears
//! hashes along the touched path; hashes and persistence are recomputed
//! lazily. Children of a persisted node are referenced by hash and loaded
//! from the blob store on demand.

use std::sync::Arc;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::crypto::hash::sha256;
use crate::db::Db;
use crate::types::Hash;

#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    #[error("key not found")]
    NotFound,
    #[error("missing node {0} in backing store")]
    MissingNode(Hash),
    #[error("corrupt node encoding: {0}")]
    Corrupt(#[from] CodecError),
}

/// Child reference: either persisted (by hash) or held in memory.
#[derive(Clone, Debug)]
pub enum Child {
    Hash(Hash),
    Node(Box<IavlNode>),
}

impl Child {
    /// Height and size without pulling an in-memory child into a new box.
    fn info(&self, db: &Arc<dyn Db>) -> Result<(u8, u64), TreeError> {
        match self {
            Child::Node(n) => Ok((n.height, n.size)),
            Child::Hash(h) => {
                let n = IavlNode::load(db, *h)?;
                Ok((n.height, n.size))
            }
        }
    }

    fn balance_factor(&self, db: &Arc<dyn Db>) -> Result<i32, TreeError> {
        match self {
            Child::Node(n) => n.balance_factor(db),
            Child::Hash(h) => IavlNode::load(db, *h)?.balance_factor(db),
        }
    }

    fn into_node(self, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        match self {
            Child::Node(n) => Ok(n),
            Child::Hash(h) => Ok(Box::new(IavlNode::load(db, h)?)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IavlNode {
    pub key: Vec<u8>,
    pub value: Vec<u8>, // meaningful only when height == 0
    pub height: u8,
    pub size: u64,
    pub hash: Option<Hash>,
    pub left: Option<Child>,
    pub right: Option<Child>,
    pub persisted: bool,
}

impl IavlNode {
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            height: 0,
            size: 1,
            hash: None,
            left: None,
            right: None,
            persisted: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Materialize a node from the blob store by its hash.
    pub fn load(db: &Arc<dyn Db>, hash: Hash) -> Result<IavlNode, TreeError> {
        let bytes = db.get(&hash.0).ok_or(TreeError::MissingNode(hash))?;
        let mut node = IavlNode::decode(&bytes)?;
        node.hash = Some(hash);
        node.persisted = true;
        Ok(node)
    }

    fn decode(bytes: &[u8]) -> Result<IavlNode, TreeError> {
        let mut d = Decoder::new(bytes);
        let height = d.get_u8()?;
        let size = d.get_u64()?;
        let key = d.get_bytes()?;
        let node = if height == 0 {
            let value = d.get_bytes()?;
            IavlNode {
                key,
                value,
                height,
                size,
                hash: None,
                left: None,
                right: None,
                persisted: false,
            }
        } else {
            let left_hash = d.get_hash()?;
            let right_hash = d.get_hash()?;
            IavlNode {
                key,
                value: Vec::new(),
                height,
                size,
                hash: None,
                left: Some(Child::Hash(left_hash)),
                right: Some(Child::Hash(right_hash)),
                persisted: false,
            }
        };
        d.finish()?;
        Ok(node)
    }

    /// Canonical encoding; inner children must already be collapsed to hashes.
    fn encode_persisted(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(self.height);
        e.put_u64(self.size);
        e.put_bytes(&self.key);
        if self.is_leaf() {
            e.put_bytes(&self.value);
        } else {
            match (&self.left, &self.right) {
                (Some(Child::Hash(lh)), Some(Child::Hash(rh))) => {
                    e.put_hash(lh);
                    e.put_hash(rh);
                }
                _ => unreachable!("children collapsed before persistence"),
            }
        }
        e.into_bytes()
    }

    fn encode_for_hash(&mut self, count: &mut u64) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(self.height);
        e.put_u64(self.size);
        e.put_bytes(&self.key);
        if self.is_leaf() {
            e.put_bytes(&self.value);
        } else {
            let lh = match self.left.as_mut().expect("inner has left") {
                Child::Hash(h) => *h,
                Child::Node(n) => n.hash_with_count(count),
            };
            let rh = match self.right.as_mut().expect("inner has right") {
                Child::Hash(h) => *h,
                Child::Node(n) => n.hash_with_count(count),
            };
            e.put_hash(&lh);
            e.put_hash(&rh);
        }
        e.into_bytes()
    }

    pub fn get(&self, db: &Arc<dyn Db>, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.is_leaf() {
            return Ok(if self.key == key {
                Some(self.value.clone())
            } else {
                None
            });
        }
        let child = if key < self.key.as_slice() {
            self.left.as_ref().expect("inner has left")
        } else {
            self.right.as_ref().expect("inner has right")
        };
        match child {
            Child::Node(n) => n.get(db, key),
            Child::Hash(h) => IavlNode::load(db, *h)?.get(db, key),
        }
    }

    fn take_left(&mut self, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        self.left.take().expect("inner has left").into_node(db)
    }

    fn take_right(&mut self, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        self.right.take().expect("inner has right").into_node(db)
    }

    /// Mark this node modified: its hash is stale and it must be re-saved.
    fn touch(&mut self) {
        self.hash = None;
        self.persisted = false;
    }

    pub fn set(
        self: Box<Self>,
        db: &Arc<dyn Db>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Box<IavlNode>, bool), TreeError> {
        let mut node = self;
        if node.is_leaf() {
            return Ok(if key < node.key.as_slice() {
                let inner = IavlNode {
                    key: node.key.clone(),
                    value: Vec::new(),
                    height: 1,
                    size: 2,
                    hash: None,
                    left: Some(Child::Node(Box::new(IavlNode::new_leaf(
                        key.to_vec(),
                        value.to_vec(),
                    )))),
                    right: Some(Child::Node(node)),
                    persisted: false,
                };
                (Box::new(inner), false)
            } else if key == node.key.as_slice() {
                (
                    Box::new(IavlNode::new_leaf(key.to_vec(), value.to_vec())),
                    true,
                )
            } else {
                let inner = IavlNode {
                    key: key.to_vec(),
                    value: Vec::new(),
                    height: 1,
                    size: 2,
                    hash: None,
                    left: Some(Child::Node(node)),
                    right: Some(Child::Node(Box::new(IavlNode::new_leaf(
                        key.to_vec(),
                        value.to_vec(),
                    )))),
                    persisted: false,
                };
                (Box::new(inner), false)
            });
        }

        node.touch();
        let updated = if key < node.key.as_slice() {
            let left = node.take_left(db)?;
            let (new_left, updated) = left.set(db, key, value)?;
            node.left = Some(Child::Node(new_left));
            updated
        } else {
            let right = node.take_right(db)?;
            let (new_right, updated) = right.set(db, key, value)?;
            node.right = Some(Child::Node(new_right));
            updated
        };
        if updated {
            Ok((node, updated))
        } else {
            node.calc_height_and_size(db)?;
            Ok((node.balance(db)?, updated))
        }
    }

    /// Removal result: the replacement subtree (None when a leaf vanished),
    /// the new smallest key to propagate upward, and the removed value.
    /// Callers must ensure the key exists; a miss consumes the node.
    pub fn remove(
        self: Box<Self>,
        db: &Arc<dyn Db>,
        key: &[u8],
    ) -> Result<(Option<Box<IavlNode>>, Option<Vec<u8>>, Vec<u8>), TreeError> {
        let mut node = self;
        if node.is_leaf() {
            return if node.key == key {
                Ok((None, None, node.value))
            } else {
                Err(TreeError::NotFound)
            };
        }

        if key < node.key.as_slice() {
            let left = node.take_left(db)?;
            let (new_left, new_key, value) = left.remove(db, key)?;
            match new_left {
                None => {
                    // The left leaf vanished; the right subtree replaces us
                    // and our key becomes the new smallest key upstream.
                    let right = node.take_right(db)?;
                    Ok((Some(right), Some(node.key), value))
                }
                Some(new_left) => {
                    node.touch();
                    node.left = Some(Child::Node(new_left));
                    node.calc_height_and_size(db)?;
                    Ok((Some(node.balance(db)?), new_key, value))
                }
            }
        } else {
            let right = node.take_right(db)?;
            let (new_right, new_key, value) = right.remove(db, key)?;
            match new_right {
                None => {
                    let left = node.take_left(db)?;
                    Ok((Some(left), None, value))
                }
                Some(new_right) => {
                    node.touch();
                    node.right = Some(Child::Node(new_right));
                    if let Some(k) = new_key {
                        node.key = k;
                    }
                    node.calc_height_and_size(db)?;
                    Ok((Some(node.balance(db)?), None, value))
                }
            }
        }
    }

    pub fn hash_with_count(&mut self, count: &mut u64) -> Hash {
        if let Some(h) = self.hash {
            return h;
        }
        let bytes = self.encode_for_hash(count);
        let h = sha256(&bytes);
        self.hash = Some(h);
        *count += 1;
        h
    }

    /// Idempotently write every unpersisted node under its hash.
    pub fn save(&mut self, db: &Arc<dyn Db>) -> Hash {
        let mut count = 0u64;
        let hash = self.hash_with_count(&mut count);
        if self.persisted {
            return hash;
        }
        if let Some(Child::Node(left)) = &mut self.left {
            let lh = left.save(db);
            self.left = Some(Child::Hash(lh));
        }
        if let Some(Child::Node(right)) = &mut self.right {
            let rh = right.save(db);
            self.right = Some(Child::Hash(rh));
        }
        db.set(&hash.0, &self.encode_persisted());
        self.persisted = true;
        hash
    }

    fn calc_height_and_size(&mut self, db: &Arc<dyn Db>) -> Result<(), TreeError> {
        let (lh, ls) = self.left.as_ref().expect("inner has left").info(db)?;
        let (rh, rs) = self.right.as_ref().expect("inner has right").info(db)?;
        self.height = lh.max(rh) + 1;
        self.size = ls + rs;
        Ok(())
    }

    fn balance_factor(&self, db: &Arc<dyn Db>) -> Result<i32, TreeError> {
        if self.is_leaf() {
            return Ok(0);
        }
        let (lh, _) = self.left.as_ref().expect("inner has left").info(db)?;
        let (rh, _) = self.right.as_ref().expect("inner has right").info(db)?;
        Ok(lh as i32 - rh as i32)
    }

    fn rotate_right(mut self: Box<Self>, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        self.touch();
        let mut new_root = self.take_left(db)?;
        new_root.touch();
        self.left = new_root.right.take();
        self.calc_height_and_size(db)?;
        new_root.right = Some(Child::Node(self));
        new_root.calc_height_and_size(db)?;
        Ok(new_root)
    }

    fn rotate_left(mut self: Box<Self>, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        self.touch();
        let mut new_root = self.take_right(db)?;
        new_root.touch();
        self.right = new_root.left.take();
        self.calc_height_and_size(db)?;
        new_root.left = Some(Child::Node(self));
        new_root.calc_height_and_size(db)?;
        Ok(new_root)
    }

    /// The four AVL cases.
    fn balance(mut self: Box<Self>, db: &Arc<dyn Db>) -> Result<Box<IavlNode>, TreeError> {
        let factor = self.balance_factor(db)?;
        if factor > 1 {
            if self.left.as_ref().expect("inner has left").balance_factor(db)? >= 0 {
                // left-left
                self.rotate_right(db)
            } else {
                // left-right
                self.touch();
                let left = self.take_left(db)?;
                self.left = Some(Child::Node(left.rotate_left(db)?));
                self.rotate_right(db)
            }
        } else if factor < -1 {
            if self.right.as_ref().expect("inner has right").balance_factor(db)? <= 0 {
                // right-right
                self.rotate_left(db)
            } else {
                // right-left
                self.touch();
                let right = self.take_right(db)?;
                self.right = Some(Child::Node(right.rotate_right(db)?));
                self.rotate_left(db)
            }
        } else {
            Ok(self)
        }
    }
}
