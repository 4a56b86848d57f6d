//! Canonical codec round-trips for primitives and protocol types.

use merklebft::codec::{CodecError, Decoder, Encoder};
use merklebft::crypto::ed25519::{generate_keypair, sign};
use merklebft::crypto::Signature;
use merklebft::types::{
    Block, BlockData, BlockHeader, CommitSig, Hash, PartSetHeader, Pol, PolCommit, PolVote,
    Proposal, SendTx, Tx, TxInput, TxOutput, Validation, Vote, VoteType,
};

#[test]
fn test_primitive_round_trip() {
    let mut e = Encoder::new();
    e.put_u8(0xAB);
    e.put_u16(0xCDEF);
    e.put_u32(0xDEADBEEF);
    e.put_u64(0x0123456789ABCDEF);
    e.put_i64(-42);
    e.put_bytes(b"hello");
    e.put_string("world");
    e.put_opt_hash(&None);
    e.put_opt_hash(&Some(Hash([7u8; 32])));
    let bytes = e.into_bytes();

    let mut d = Decoder::new(&bytes);
    assert_eq!(d.get_u8().unwrap(), 0xAB);
    assert_eq!(d.get_u16().unwrap(), 0xCDEF);
    assert_eq!(d.get_u32().unwrap(), 0xDEADBEEF);
    assert_eq!(d.get_u64().unwrap(), 0x0123456789ABCDEF);
    assert_eq!(d.get_i64().unwrap(), -42);
    assert_eq!(d.get_bytes().unwrap(), b"hello".to_vec());
    assert_eq!(d.get_string().unwrap(), "world");
    assert_eq!(d.get_opt_hash().unwrap(), None);
    assert_eq!(d.get_opt_hash().unwrap(), Some(Hash([7u8; 32])));
    d.finish().unwrap();
}

#[test]
fn test_integers_are_big_endian() {
    let mut e = Encoder::new();
    e.put_u32(1);
    assert_eq!(e.into_bytes(), vec![0, 0, 0, 1]);

    let mut e = Encoder::new();
    e.put_u64(0x0102030405060708);
    assert_eq!(e.into_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_truncated_input_is_eof() {
    let mut d = Decoder::new(&[0, 0]);
    match d.get_u32() {
        Err(CodecError::Eof) => {}
        other => panic!("expected eof, got {:?}", other),
    }
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut e = Encoder::new();
    e.put_u8(1);
    e.put_u8(2);
    let bytes = e.into_bytes();
    let mut d = Decoder::new(&bytes);
    d.get_u8().unwrap();
    assert!(d.finish().is_err(), "trailing bytes must fail finish");
}

fn sample_vote() -> Vote {
    let (sk, pk) = generate_keypair();
    let mut vote = Vote {
        height: 12,
        round: 3,
        vote_type: VoteType::Precommit,
        block_hash: Some(Hash([9u8; 32])),
        block_parts: PartSetHeader {
            total: 4,
            hash: Hash([1u8; 32]),
        },
        signer: pk.address(),
        signature: Signature::ZERO,
    };
    vote.signature = sign(&sk, &vote.sign_bytes("codec-chain"));
    vote
}

#[test]
fn test_vote_round_trip() {
    let vote = sample_vote();
    let mut e = Encoder::new();
    vote.encode(&mut e);
    let bytes = e.into_bytes();

    let mut d = Decoder::new(&bytes);
    let decoded = Vote::decode(&mut d).unwrap();
    d.finish().unwrap();
    assert_eq!(decoded, vote);
}

#[test]
fn test_block_round_trip() {
    let tx = Tx::Send(SendTx {
        inputs: vec![TxInput {
            address: merklebft::types::Address([3u8; 20]),
            amount: 100,
            sequence: 1,
            signature: Signature([5u8; 64]),
            pub_key: None,
        }],
        outputs: vec![TxOutput {
            address: merklebft::types::Address([4u8; 20]),
            amount: 90,
        }],
    });
    let data = BlockData { txs: vec![tx] };
    let validation = Validation {
        commits: vec![CommitSig {
            signer: merklebft::types::Address([1u8; 20]),
            round: 0,
            signature: Signature([2u8; 64]),
        }],
    };
    let block = Block {
        header: BlockHeader {
            chain_id: "codec-chain".to_string(),
            height: 5,
            time: 1_700_000_000_000_000,
            fees: 10,
            num_txs: 1,
            last_block_hash: Some(Hash([8u8; 32])),
            last_block_parts: PartSetHeader {
                total: 2,
                hash: Hash([6u8; 32]),
            },
            last_validation_hash: validation.hash(),
            data_hash: data.hash(),
            state_hash: Hash([7u8; 32]),
        },
        last_validation: validation,
        data,
    };

    let bytes = block.encode_to_bytes();
    let decoded = Block::decode_from_bytes(&bytes).unwrap();
    assert_eq!(decoded, block);
    assert_eq!(decoded.hash(), block.hash());
}

#[test]
fn test_block_hash_covers_header_only_through_digests() {
    let block = {
        let data = BlockData { txs: vec![] };
        Block {
            header: BlockHeader {
                chain_id: "codec-chain".to_string(),
                height: 1,
                time: 1,
                fees: 0,
                num_txs: 0,
                last_block_hash: None,
                last_block_parts: PartSetHeader::default(),
                last_validation_hash: Validation::default().hash(),
                data_hash: data.hash(),
                state_hash: Hash::ZERO,
            },
            last_validation: Validation::default(),
            data,
        }
    };
    let mut other = block.clone();
    other.header.height = 2;
    assert_ne!(block.hash(), other.hash());
}

#[test]
fn test_proposal_round_trip() {
    let proposal = Proposal {
        height: 8,
        round: 1,
        block_parts: PartSetHeader {
            total: 3,
            hash: Hash([2u8; 32]),
        },
        pol_parts: PartSetHeader::default(),
        signature: Signature([9u8; 64]),
    };
    let mut e = Encoder::new();
    proposal.encode(&mut e);
    let bytes = e.into_bytes();
    let mut d = Decoder::new(&bytes);
    let decoded = Proposal::decode(&mut d).unwrap();
    d.finish().unwrap();
    assert_eq!(decoded, proposal);
}

#[test]
fn test_pol_round_trip() {
    let pol = Pol {
        height: 4,
        round: 2,
        block_hash: Some(Hash([3u8; 32])),
        block_parts: PartSetHeader {
            total: 1,
            hash: Hash([4u8; 32]),
        },
        votes: vec![PolVote {
            signer: merklebft::types::Address([1u8; 20]),
            signature: Signature([1u8; 64]),
        }],
        commits: vec![PolCommit {
            signer: merklebft::types::Address([2u8; 20]),
            round: 0,
            signature: Signature([2u8; 64]),
        }],
    };
    let decoded = Pol::decode_from_bytes(&pol.encode_to_bytes()).unwrap();
    assert_eq!(decoded, pol);
}

#[test]
fn test_tx_unknown_type_rejected() {
    assert!(Tx::decode_from_bytes(&[0xFF]).is_err());
}

#[test]
fn test_tx_sign_doc_excludes_signatures() {
    let mut tx = Tx::Send(SendTx {
        inputs: vec![TxInput {
            address: merklebft::types::Address([3u8; 20]),
            amount: 100,
            sequence: 1,
            signature: Signature::ZERO,
            pub_key: None,
        }],
        outputs: vec![],
    });
    let doc_unsigned = tx.sign_bytes("codec-chain");
    if let Tx::Send(send) = &mut tx {
        send.inputs[0].signature = Signature([0xAAu8; 64]);
    }
    let doc_signed = tx.sign_bytes("codec-chain");
    assert_eq!(doc_unsigned, doc_signed, "sign doc must not cover signatures");
}
