//! IAVL+ tree invariants: shape determinism, delete undo, persistence.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use merklebft::db::{Db, MemDb};
use merklebft::merkle::{IavlTree, TreeError};

fn mem_tree() -> IavlTree {
    IavlTree::new(Arc::new(MemDb::new()))
}

#[test]
fn test_get_set_remove() {
    let mut t = mem_tree();
    assert_eq!(t.get(b"key").unwrap(), None);

    assert!(!t.set(b"key", b"value").unwrap(), "fresh key is not an update");
    assert_eq!(t.get(b"key").unwrap(), Some(b"value".to_vec()));
    assert_eq!(t.size(), 1);

    assert!(t.set(b"key", b"value2").unwrap(), "existing key is an update");
    assert_eq!(t.get(b"key").unwrap(), Some(b"value2".to_vec()));
    assert_eq!(t.size(), 1);

    assert_eq!(t.remove(b"key").unwrap(), b"value2".to_vec());
    assert_eq!(t.get(b"key").unwrap(), None);
    assert_eq!(t.size(), 0);
}

#[test]
fn test_remove_missing_is_not_found() {
    let mut t = mem_tree();
    t.set(b"a", b"1").unwrap();
    match t.remove(b"b") {
        Err(TreeError::NotFound) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    // The failed remove must not disturb the tree.
    assert_eq!(t.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(t.size(), 1);
}

#[test]
fn test_balance_bounds() {
    let mut t = mem_tree();
    // Ascending insertion is the classic worst case for an unbalanced tree.
    for i in 0u32..1000 {
        t.set(&i.to_be_bytes(), b"v").unwrap();
    }
    assert_eq!(t.size(), 1000);
    // An AVL tree of n leaves stays within ~1.44 * log2(n).
    assert!(t.height() <= 15, "height {} too large for 1000 keys", t.height());
    for i in 0u32..1000 {
        assert_eq!(t.get(&i.to_be_bytes()).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn test_hash_independent_of_insertion_order() {
    let keys: Vec<Vec<u8>> = (0u32..200).map(|i| i.to_be_bytes().to_vec()).collect();

    let mut forward = mem_tree();
    for k in &keys {
        forward.set(k, k).unwrap();
    }
    let mut reverse = mem_tree();
    for k in keys.iter().rev() {
        reverse.set(k, k).unwrap();
    }
    let mut shuffled = mem_tree();
    let mut order: Vec<usize> = (0..keys.len()).collect();
    let mut rng = StdRng::seed_from_u64(7);
    for i in (1..order.len()).rev() {
        order.swap(i, rng.gen_range(0..=i));
    }
    for i in order {
        shuffled.set(&keys[i], &keys[i]).unwrap();
    }

    let (h1, _) = forward.hash();
    let (h2, _) = reverse.hash();
    let (h3, _) = shuffled.hash();
    assert_eq!(h1, h2, "forward and reverse insertion roots differ");
    assert_eq!(h1, h3, "forward and shuffled insertion roots differ");
}

#[test]
fn test_determinism_10k_and_removal_convergence() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(10_000);
    for i in 0u32..10_000 {
        // Random prefix for shape variety, index suffix for uniqueness.
        let mut key: Vec<u8> = (0..12).map(|_| rng.gen::<u8>()).collect();
        key.extend_from_slice(&i.to_be_bytes());
        let value: Vec<u8> = (0..8).map(|_| rng.gen::<u8>()).collect();
        pairs.push((key, value));
    }

    // Two different insertion orders into two separately backed trees.
    let mut a = IavlTree::new(Arc::new(MemDb::new()));
    for (k, v) in &pairs {
        a.set(k, v).unwrap();
    }
    let mut b = IavlTree::new(Arc::new(MemDb::new()));
    for (k, v) in pairs.iter().rev() {
        b.set(k, v).unwrap();
    }
    let (root_a, _) = a.hash();
    let (root_b, _) = b.hash();
    assert_eq!(root_a, root_b, "roots diverge across insertion orders");

    // Removing every key in a third order converges to the empty root.
    let mut order: Vec<usize> = (0..pairs.len()).collect();
    for i in (1..order.len()).rev() {
        order.swap(i, rng.gen_range(0..=i));
    }
    for i in order {
        let (k, v) = &pairs[i];
        let got = a.remove(k).unwrap();
        assert_eq!(&got, v);
    }
    let (root_empty, _) = a.hash();
    assert!(root_empty.is_zero(), "tree did not drain to the empty root");
    assert_eq!(a.size(), 0);
}

#[test]
fn test_delete_undo_restores_root() {
    let mut t = mem_tree();
    for i in 0u32..50 {
        t.set(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
    }
    let (before, _) = t.hash();

    t.set(b"extra", b"x").unwrap();
    let removed = t.remove(b"extra").unwrap();
    assert_eq!(removed, b"x".to_vec());

    let (after, _) = t.hash();
    assert_eq!(before, after, "set+remove must restore the old root hash");
}

#[test]
fn test_persist_round_trip() {
    let db: Arc<dyn Db> = Arc::new(MemDb::new());
    let mut t = IavlTree::new(db.clone());
    for i in 0u32..300 {
        t.set(&i.to_be_bytes(), &(i * 2).to_be_bytes()).unwrap();
    }
    let root = t.save();
    assert!(!root.is_zero());

    let loaded = IavlTree::load(db.clone(), root).unwrap();
    assert_eq!(loaded.size(), 300);
    for i in 0u32..300 {
        assert_eq!(
            loaded.get(&i.to_be_bytes()).unwrap(),
            Some((i * 2).to_be_bytes().to_vec()),
            "key {} lost across persistence",
            i
        );
    }

    // Saving twice must be idempotent.
    let root2 = t.save();
    assert_eq!(root, root2);
}

#[test]
fn test_persisted_snapshot_survives_later_writes() {
    let db: Arc<dyn Db> = Arc::new(MemDb::new());
    let mut t = IavlTree::new(db.clone());
    for i in 0u32..100 {
        t.set(&i.to_be_bytes(), b"v1").unwrap();
    }
    let root_v1 = t.save();

    // Mutate and persist a second version.
    for i in 0u32..100 {
        t.set(&i.to_be_bytes(), b"v2").unwrap();
    }
    let root_v2 = t.save();
    assert_ne!(root_v1, root_v2);

    // The old snapshot still reads the old values.
    let snapshot = IavlTree::load(db, root_v1).unwrap();
    for i in 0u32..100 {
        assert_eq!(snapshot.get(&i.to_be_bytes()).unwrap(), Some(b"v1".to_vec()));
    }
}

#[test]
fn test_hash_count_reflects_new_nodes() {
    let mut t = mem_tree();
    t.set(b"a", b"1").unwrap();
    let (_, count) = t.hash();
    assert_eq!(count, 1, "single leaf hashes one node");

    // Hashing again recomputes nothing.
    let (_, count) = t.hash();
    assert_eq!(count, 0);

    t.set(b"b", b"2").unwrap();
    let (_, count) = t.hash();
    // New leaf plus the new inner node; the old leaf is cached.
    assert_eq!(count, 2);
}
