//! VoteSet admission: one vote per signer, signature checks, 2/3 tracking.

use ed25519_dalek::SigningKey;

use merklebft::consensus::{VoteSet, VoteSetError};
use merklebft::crypto::ed25519::sign;
use merklebft::crypto::{PubKey, Signature};
use merklebft::types::{Hash, PartSetHeader, Validator, ValidatorSet, Vote, VoteType};

const CHAIN_ID: &str = "voteset-chain";

fn make_keys(n: usize) -> Vec<SigningKey> {
    (0..n)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            SigningKey::from_bytes(&seed)
        })
        .collect()
}

fn make_validator_set(keys: &[SigningKey]) -> ValidatorSet {
    ValidatorSet::new(
        keys.iter()
            .map(|sk| Validator::new(PubKey(sk.verifying_key().to_bytes()), 1, 0))
            .collect(),
    )
}

fn signed_vote(
    sk: &SigningKey,
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_hash: Option<Hash>,
) -> Vote {
    let pk = PubKey(sk.verifying_key().to_bytes());
    let mut vote = Vote {
        height,
        round,
        vote_type,
        block_hash,
        block_parts: PartSetHeader::default(),
        signer: pk.address(),
        signature: Signature::ZERO,
    };
    vote.signature = sign(sk, &vote.sign_bytes(CHAIN_ID));
    vote
}

#[test]
fn test_add_and_tally() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset);
    let bh = Some(Hash([1u8; 32]));

    assert!(votes.add_vote(signed_vote(&keys[0], 1, 0, VoteType::Prevote, bh)).unwrap());
    assert!(votes.add_vote(signed_vote(&keys[1], 1, 0, VoteType::Prevote, bh)).unwrap());
    assert_eq!(votes.sum_for(&bh), 2);
    assert_eq!(votes.two_thirds_majority(), None);

    assert!(votes.add_vote(signed_vote(&keys[2], 1, 0, VoteType::Prevote, bh)).unwrap());
    assert_eq!(votes.two_thirds_majority(), Some(bh), "3 of 4 crosses 2/3");
}

#[test]
fn test_exact_duplicate_dropped() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset);
    let vote = signed_vote(&keys[0], 1, 0, VoteType::Prevote, Some(Hash([1u8; 32])));

    assert!(votes.add_vote(vote.clone()).unwrap());
    assert!(!votes.add_vote(vote).unwrap(), "duplicate returns false");
    assert_eq!(votes.sum_for(&Some(Hash([1u8; 32]))), 1, "no double counting");
}

#[test]
fn test_conflicting_vote_detected() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset);

    votes
        .add_vote(signed_vote(&keys[0], 1, 0, VoteType::Prevote, Some(Hash([1u8; 32]))))
        .unwrap();
    match votes.add_vote(signed_vote(&keys[0], 1, 0, VoteType::Prevote, Some(Hash([2u8; 32])))) {
        Err(VoteSetError::Conflicting(signer, existing)) => {
            assert_eq!(signer, PubKey(keys[0].verifying_key().to_bytes()).address());
            assert_eq!(existing.block_hash, Some(Hash([1u8; 32])));
        }
        other => panic!("expected conflicting vote, got {:?}", other),
    }
}

#[test]
fn test_bad_signature_rejected() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset);

    let mut vote = signed_vote(&keys[0], 1, 0, VoteType::Prevote, Some(Hash([1u8; 32])));
    vote.signature.0[0] ^= 0xFF;
    match votes.add_vote(vote) {
        Err(VoteSetError::InvalidSignature(_)) => {}
        other => panic!("expected invalid signature, got {:?}", other),
    }
}

#[test]
fn test_non_validator_rejected() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys[..3]);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset);

    match votes.add_vote(signed_vote(&keys[3], 1, 0, VoteType::Prevote, None)) {
        Err(VoteSetError::NonValidator(_)) => {}
        other => panic!("expected non-validator, got {:?}", other),
    }
}

#[test]
fn test_wrong_height_and_round_rejected() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 5, 2, VoteType::Prevote, vset);

    assert!(matches!(
        votes.add_vote(signed_vote(&keys[0], 4, 2, VoteType::Prevote, None)),
        Err(VoteSetError::WrongHeight { .. })
    ));
    assert!(matches!(
        votes.add_vote(signed_vote(&keys[0], 5, 1, VoteType::Prevote, None)),
        Err(VoteSetError::WrongRound { .. })
    ));
    assert!(matches!(
        votes.add_vote(signed_vote(&keys[0], 5, 2, VoteType::Precommit, None)),
        Err(VoteSetError::WrongType)
    ));
}

#[test]
fn test_commit_votes_accept_earlier_rounds() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut commits = VoteSet::new(CHAIN_ID, 1, 3, VoteType::Commit, vset);
    let bh = Some(Hash([1u8; 32]));

    // Commits cast at rounds 0..3 all count at round 3.
    assert!(commits.add_vote(signed_vote(&keys[0], 1, 0, VoteType::Commit, bh)).unwrap());
    assert!(commits.add_vote(signed_vote(&keys[1], 1, 2, VoteType::Commit, bh)).unwrap());
    assert!(commits.add_vote(signed_vote(&keys[2], 1, 3, VoteType::Commit, bh)).unwrap());
    assert_eq!(commits.two_thirds_majority(), Some(bh));

    // But not future rounds.
    assert!(matches!(
        commits.add_vote(signed_vote(&keys[3], 1, 4, VoteType::Commit, bh)),
        Err(VoteSetError::CommitRoundAhead { .. })
    ));
}

#[test]
fn test_two_thirds_exclusive() {
    // One vote per signer means two hashes can never both exceed 2/3.
    let keys = make_keys(9);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset.clone());
    let a = Some(Hash([1u8; 32]));
    let b = Some(Hash([2u8; 32]));

    for key in &keys[..7] {
        votes.add_vote(signed_vote(key, 1, 0, VoteType::Prevote, a)).unwrap();
    }
    for key in &keys[7..] {
        votes.add_vote(signed_vote(key, 1, 0, VoteType::Prevote, b)).unwrap();
    }
    assert_eq!(votes.two_thirds_majority(), Some(a));
    assert!(votes.sum_for(&a) * 3 > vset.total_voting_power() * 2);
    assert!(votes.sum_for(&b) * 3 <= vset.total_voting_power());
}

#[test]
fn test_make_validation_collects_majority_commits() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut commits = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Commit, vset);
    let bh = Some(Hash([1u8; 32]));

    assert!(commits.make_validation().is_none(), "no majority yet");
    for key in &keys[..3] {
        commits.add_vote(signed_vote(key, 1, 0, VoteType::Commit, bh)).unwrap();
    }
    let validation = commits.make_validation().unwrap();
    assert_eq!(validation.commits.len(), 3);
}

#[test]
fn test_bit_array_tracks_votes() {
    let keys = make_keys(4);
    let vset = make_validator_set(&keys);
    let mut votes = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vset.clone());

    votes.add_vote(signed_vote(&keys[2], 1, 0, VoteType::Prevote, None)).unwrap();
    let bits = votes.bit_array();
    let expected_index = vset
        .index_of(&PubKey(keys[2].verifying_key().to_bytes()).address())
        .unwrap();
    assert!(bits.get_index(expected_index));
    assert_eq!((0..4).filter(|i| bits.get_index(*i)).count(), 1);
}
