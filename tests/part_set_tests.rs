//! Part set splitting, inclusion proofs, and reassembly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use merklebft::types::{Part, PartSet, PartSetError, PART_SIZE};

fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen::<u8>()).collect()
}

#[test]
fn test_split_and_reassemble() {
    let data = random_data(PART_SIZE * 3 + 17, 1);
    let parts = PartSet::from_data(&data);
    assert_eq!(parts.total(), 4);
    assert!(parts.is_complete());
    assert_eq!(parts.assemble().unwrap(), data);
}

#[test]
fn test_single_part_data() {
    let data = random_data(100, 2);
    let parts = PartSet::from_data(&data);
    assert_eq!(parts.total(), 1);
    let part = parts.get_part(0).unwrap();
    assert!(part.proof.is_empty(), "single leaf needs no proof");
    assert_eq!(parts.header().hash, part.hash());
}

#[test]
fn test_transfer_through_proofs() {
    let data = random_data(PART_SIZE * 5 + 3, 3);
    let source = PartSet::from_data(&data);
    let mut sink = PartSet::new_from_header(source.header());

    assert!(!sink.is_complete());
    assert!(sink.assemble().is_err());

    // Deliver out of order, as gossip would.
    let order = [3u32, 0, 5, 1, 4, 2];
    for index in order {
        let part = source.get_part(index).unwrap().clone();
        assert!(sink.add_part(part).unwrap(), "part {} should be new", index);
    }
    assert!(sink.is_complete());
    assert_eq!(sink.assemble().unwrap(), data);
}

#[test]
fn test_duplicate_part_not_double_counted() {
    let data = random_data(PART_SIZE * 2, 4);
    let source = PartSet::from_data(&data);
    let mut sink = PartSet::new_from_header(source.header());

    let part = source.get_part(0).unwrap().clone();
    assert!(sink.add_part(part.clone()).unwrap());
    assert!(!sink.add_part(part).unwrap(), "duplicate add returns false");
    assert_eq!(sink.count(), 1);
}

#[test]
fn test_corrupt_part_rejected() {
    let data = random_data(PART_SIZE * 4, 5);
    let source = PartSet::from_data(&data);
    let mut sink = PartSet::new_from_header(source.header());

    let mut part = source.get_part(1).unwrap().clone();
    part.bytes[0] ^= 0xFF;
    match sink.add_part(part) {
        Err(PartSetError::InvalidProof(1)) => {}
        other => panic!("expected invalid proof, got {:?}", other),
    }

    // A part claiming the wrong index fails its proof too.
    let mut part = source.get_part(2).unwrap().clone();
    part.index = 3;
    assert!(sink.add_part(part).is_err());

    // Out-of-bounds index is rejected outright.
    let part = Part {
        index: 99,
        bytes: vec![1, 2, 3],
        proof: vec![],
    };
    match sink.add_part(part) {
        Err(PartSetError::IndexOutOfBounds(99)) => {}
        other => panic!("expected out of bounds, got {:?}", other),
    }
}

#[test]
fn test_bit_array_tracks_parts() {
    let data = random_data(PART_SIZE * 3, 6);
    let source = PartSet::from_data(&data);
    let mut sink = PartSet::new_from_header(source.header());

    assert!(sink.bit_array().none_set());
    sink.add_part(source.get_part(1).unwrap().clone()).unwrap();
    let bits = sink.bit_array();
    assert!(!bits.get_index(0));
    assert!(bits.get_index(1));
    assert!(!bits.get_index(2));

    // The diff against the source picks only what the sink lacks.
    let missing = source.bit_array().sub(&bits);
    assert!(missing.get_index(0));
    assert!(!missing.get_index(1));
    assert!(missing.get_index(2));
}

#[test]
fn test_empty_data_still_has_one_part() {
    let parts = PartSet::from_data(&[]);
    assert_eq!(parts.total(), 1);
    assert_eq!(parts.assemble().unwrap(), Vec::<u8>::new());
}
