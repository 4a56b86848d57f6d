//! Validator set ordering, proposer rotation, and commit verification.

use ed25519_dalek::SigningKey;

use merklebft::crypto::ed25519::sign;
use merklebft::crypto::{PubKey, Signature};
use merklebft::types::{
    Address, CommitSig, Hash, PartSetHeader, Validation, Validator, ValidatorSet, Vote, VoteType,
};

const CHAIN_ID: &str = "valset-chain";

fn make_keys(n: usize) -> Vec<SigningKey> {
    (0..n)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            SigningKey::from_bytes(&seed)
        })
        .collect()
}

fn make_set(keys: &[SigningKey], powers: &[u64]) -> ValidatorSet {
    ValidatorSet::new(
        keys.iter()
            .zip(powers)
            .map(|(sk, power)| Validator::new(PubKey(sk.verifying_key().to_bytes()), *power, 0))
            .collect(),
    )
}

#[test]
fn test_deterministic_order_by_id() {
    let keys = make_keys(8);
    let set = make_set(&keys, &[1; 8]);
    let ids: Vec<Address> = set.iter().map(|v| v.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "validators must iterate in id order");
}

#[test]
fn test_proposer_rotation_equal_power() {
    let keys = make_keys(4);
    let mut set = make_set(&keys, &[1; 4]);

    // Over 4 rounds with equal power, every validator proposes exactly once.
    let mut seen = Vec::new();
    for _ in 0..4 {
        set.increment_accum();
        let proposer = set.proposer().unwrap().id;
        assert!(!seen.contains(&proposer), "proposer repeated within cycle");
        seen.push(proposer);
    }
    assert_eq!(seen.len(), 4);

    // The cycle repeats deterministically.
    set.increment_accum();
    assert_eq!(set.proposer().unwrap().id, seen[0]);
}

#[test]
fn test_proposer_weighted_by_power() {
    let keys = make_keys(2);
    let mut set = make_set(&keys, &[3, 1]);
    let heavy = set
        .iter()
        .find(|v| v.voting_power == 3)
        .map(|v| v.id)
        .unwrap();

    let mut heavy_turns = 0;
    for _ in 0..8 {
        set.increment_accum();
        if set.proposer().unwrap().id == heavy {
            heavy_turns += 1;
        }
    }
    assert_eq!(heavy_turns, 6, "3-power validator proposes 3 of every 4 rounds");
}

#[test]
fn test_accum_ties_break_by_id() {
    let keys = make_keys(3);
    let set = make_set(&keys, &[1; 3]);
    // All accums are zero; the smallest id must win.
    let expected = set.iter().map(|v| v.id).min().unwrap();
    assert_eq!(set.proposer().unwrap().id, expected);
}

#[test]
fn test_add_remove_update() {
    let keys = make_keys(3);
    let mut set = make_set(&keys[..2], &[1, 2]);
    assert_eq!(set.total_voting_power(), 3);

    let extra = Validator::new(PubKey(keys[2].verifying_key().to_bytes()), 4, 5);
    assert!(set.add(extra.clone()));
    assert!(!set.add(extra.clone()), "duplicate add rejected");
    assert_eq!(set.total_voting_power(), 7);

    let mut updated = extra.clone();
    updated.voting_power = 1;
    assert!(set.update(updated));
    assert_eq!(set.total_voting_power(), 4);

    let removed = set.remove(&extra.id).unwrap();
    assert_eq!(removed.voting_power, 1);
    assert_eq!(set.total_voting_power(), 3);
    assert!(set.remove(&extra.id).is_none());
}

#[test]
fn test_set_hash_changes_with_membership() {
    let keys = make_keys(3);
    let a = make_set(&keys[..2], &[1, 1]);
    let b = make_set(&keys, &[1, 1, 1]);
    assert_ne!(a.hash(), b.hash());
}

fn commit_sig(
    sk: &SigningKey,
    height: u64,
    round: u32,
    block_hash: Hash,
    block_parts: PartSetHeader,
) -> CommitSig {
    let pk = PubKey(sk.verifying_key().to_bytes());
    let doc = Vote::sign_doc(
        CHAIN_ID,
        height,
        round,
        VoteType::Commit,
        &Some(block_hash),
        &block_parts,
    );
    CommitSig {
        signer: pk.address(),
        round,
        signature: sign(sk, &doc),
    }
}

#[test]
fn test_verify_validation() {
    let keys = make_keys(4);
    let set = make_set(&keys, &[1; 4]);
    let block_hash = Hash([7u8; 32]);
    let parts = PartSetHeader {
        total: 2,
        hash: Hash([8u8; 32]),
    };

    // 3 of 4 commits at mixed rounds: enough.
    let validation = Validation {
        commits: vec![
            commit_sig(&keys[0], 10, 0, block_hash, parts),
            commit_sig(&keys[1], 10, 1, block_hash, parts),
            commit_sig(&keys[2], 10, 0, block_hash, parts),
        ],
    };
    set.verify_validation(CHAIN_ID, block_hash, parts, 10, &validation)
        .unwrap();

    // 2 of 4 is not more than 2/3.
    let thin = Validation {
        commits: validation.commits[..2].to_vec(),
    };
    assert!(set
        .verify_validation(CHAIN_ID, block_hash, parts, 10, &thin)
        .is_err());

    // Duplicate signers cannot inflate power.
    let duped = Validation {
        commits: vec![
            validation.commits[0].clone(),
            validation.commits[0].clone(),
            validation.commits[1].clone(),
        ],
    };
    assert!(set
        .verify_validation(CHAIN_ID, block_hash, parts, 10, &duped)
        .is_err());

    // A signature over the wrong block hash fails.
    let wrong = Validation {
        commits: vec![
            commit_sig(&keys[0], 10, 0, Hash([9u8; 32]), parts),
            validation.commits[1].clone(),
            validation.commits[2].clone(),
        ],
    };
    assert!(set
        .verify_validation(CHAIN_ID, block_hash, parts, 10, &wrong)
        .is_err());
}
