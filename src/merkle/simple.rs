//! Simple Merkle tree over a list of hashes, with inclusion proofs.
//!
//! The tree splits a list of n leaves into a left half of ceil(n/2) and the
//! remainder on the right; inner hashes are SHA-256 over the concatenated
//! child hashes. Part sets use this to root their part hashes.

use crate::crypto::hash::sha256;
use crate::types::Hash;

pub fn simple_hash_from_hashes(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => Hash::ZERO,
        1 => hashes[0],
        n => {
            let mid = (n + 1) / 2;
            let left = simple_hash_from_hashes(&hashes[..mid]);
            let right = simple_hash_from_hashes(&hashes[mid..]);
            inner_hash(&left, &right)
        }
    }
}

/// Sibling path from each leaf to the root, leaf-to-root order.
pub fn simple_proofs_from_hashes(hashes: &[Hash]) -> Vec<Vec<Hash>> {
    let mut proofs = vec![Vec::new(); hashes.len()];
    build_proofs(hashes, 0, &mut proofs);
    proofs
}

fn build_proofs(hashes: &[Hash], offset: usize, proofs: &mut [Vec<Hash>]) -> Hash {
    match hashes.len() {
        0 => Hash::ZERO,
        1 => hashes[0],
        n => {
            let mid = (n + 1) / 2;
            let left = build_proofs(&hashes[..mid], offset, proofs);
            let right = build_proofs(&hashes[mid..], offset + mid, proofs);
            for proof in proofs[offset..offset + mid].iter_mut() {
                proof.push(right);
            }
            for proof in proofs[offset + mid..offset + n].iter_mut() {
                proof.push(left);
            }
            inner_hash(&left, &right)
        }
    }
}

/// Verify a leaf's inclusion under `root` at `index` of `total` leaves.
/// The proof is in leaf-to-root order, so the top-level sibling comes last.
pub fn verify_proof(leaf: Hash, index: usize, total: usize, proof: &[Hash], root: Hash) -> bool {
    if index >= total || total == 0 {
        return false;
    }
    match compute_root(leaf, index, total, proof) {
        Some(computed) => computed == root,
        None => false,
    }
}

fn compute_root(leaf: Hash, index: usize, total: usize, proof: &[Hash]) -> Option<Hash> {
    if total == 1 {
        return if proof.is_empty() { Some(leaf) } else { None };
    }
    let (sibling, rest) = proof.split_last()?;
    let mid = (total + 1) / 2;
    if index < mid {
        let sub = compute_root(leaf, index, mid, rest)?;
        Some(inner_hash(&sub, sibling))
    } else {
        let sub = compute_root(leaf, index - mid, total - mid, rest)?;
        Some(inner_hash(sibling, &sub))
    }
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left.0);
    buf[32..].copy_from_slice(&right.0);
    sha256(&buf)
}
