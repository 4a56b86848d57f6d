//! Block pool: window management, assignment, timeouts, redo.

use tokio::sync::mpsc;

use merklebft::pool::{BlockPool, BlockRequest};
use merklebft::types::{Block, BlockData, BlockHeader, Hash, PartSetHeader, Validation};

fn make_block(height: u64) -> Block {
    let data = BlockData { txs: vec![] };
    Block {
        header: BlockHeader {
            chain_id: "pool-chain".to_string(),
            height,
            time: height as i64 * 1_000_000,
            fees: 0,
            num_txs: 0,
            last_block_hash: if height == 1 { None } else { Some(Hash([1u8; 32])) },
            last_block_parts: PartSetHeader::default(),
            last_validation_hash: Validation::default().hash(),
            data_hash: data.hash(),
            state_hash: Hash::ZERO,
        },
        last_validation: Validation::default(),
        data,
    }
}

fn make_pool(start: u64) -> (BlockPool, mpsc::Receiver<BlockRequest>, mpsc::Receiver<String>) {
    let (requests_tx, requests_rx) = mpsc::channel(100);
    let (timeouts_tx, timeouts_rx) = mpsc::channel(100);
    (
        BlockPool::new(start, requests_tx, timeouts_tx),
        requests_rx,
        timeouts_rx,
    )
}

fn drain_requests(rx: &mut mpsc::Receiver<BlockRequest>) -> Vec<BlockRequest> {
    let mut out = Vec::new();
    while let Ok(req) = rx.try_recv() {
        out.push(req);
    }
    out
}

#[test]
fn test_requests_go_to_capable_peers() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.set_peer_height(&"peer-a".to_string(), 5);
    pool.make_next_requests();

    let requests = drain_requests(&mut requests_rx);
    let heights: Vec<u64> = requests.iter().map(|r| r.height).collect();
    assert_eq!(heights, vec![1, 2, 3, 4, 5], "window capped at peer height");
    assert!(requests.iter().all(|r| r.peer_id == "peer-a"));

    // Nothing further until the peer advertises more.
    pool.make_next_requests();
    assert!(drain_requests(&mut requests_rx).is_empty());
}

#[test]
fn test_no_peers_no_requests() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.make_next_requests();
    assert!(drain_requests(&mut requests_rx).is_empty());
    assert!(pool.is_caught_up(), "no peers means nothing to fetch");
}

#[test]
fn test_add_block_only_from_assigned_peer() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.set_peer_height(&"peer-a".to_string(), 3);
    pool.set_peer_height(&"peer-b".to_string(), 3);
    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);
    let assigned = requests.iter().find(|r| r.height == 1).unwrap();

    let other = if assigned.peer_id == "peer-a" { "peer-b" } else { "peer-a" };
    assert!(
        !pool.add_block(make_block(1), &other.to_string()),
        "unsolicited block discarded"
    );
    assert!(pool.add_block(make_block(1), &assigned.peer_id));
    assert!(
        !pool.add_block(make_block(1), &assigned.peer_id),
        "already received"
    );
}

#[test]
fn test_peek_pop_and_base_monotonic() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.set_peer_height(&"peer-a".to_string(), 10);
    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);

    let peer_for = |height: u64| {
        requests
            .iter()
            .find(|r| r.height == height)
            .unwrap()
            .peer_id
            .clone()
    };

    // Only the second block arrived: peek yields nothing usable.
    assert!(pool.add_block(make_block(2), &peer_for(2)));
    let (first, second) = pool.peek_two_blocks();
    assert!(first.is_none());
    assert!(second.is_some());

    assert!(pool.add_block(make_block(1), &peer_for(1)));
    let (first, second) = pool.peek_two_blocks();
    assert_eq!(first.unwrap().header.height, 1);
    assert_eq!(second.unwrap().header.height, 2);

    assert_eq!(pool.base(), 1);
    pool.pop_request();
    assert_eq!(pool.base(), 2, "base advances on pop");
    pool.pop_request();
    assert_eq!(pool.base(), 3);
}

#[test]
fn test_redo_request_resets_and_names_peer() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.set_peer_height(&"peer-a".to_string(), 4);
    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);
    let peer = requests[0].peer_id.clone();

    assert!(pool.add_block(make_block(1), &peer));
    let served_by = pool.redo_request(1);
    assert_eq!(served_by, Some(peer.clone()));

    // The height is re-assignable.
    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);
    assert!(requests.iter().any(|r| r.height == 1), "height 1 re-requested");
}

#[test]
fn test_remove_peer_reverts_assignments() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(1);
    pool.set_peer_height(&"peer-a".to_string(), 3);
    pool.make_next_requests();
    drain_requests(&mut requests_rx);
    assert!(pool.add_block(make_block(1), &"peer-a".to_string()));

    pool.remove_peer(&"peer-a".to_string());
    let (first, _) = pool.peek_two_blocks();
    assert!(first.is_none(), "blocks from removed peers are dropped");

    // A new peer picks the heights up again.
    pool.set_peer_height(&"peer-b".to_string(), 3);
    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);
    assert!(requests.iter().any(|r| r.height == 1 && r.peer_id == "peer-b"));
}

#[test]
fn test_caught_up_tracks_max_peer_height() {
    let (pool, mut requests_rx, _timeouts_rx) = make_pool(5);
    assert!(pool.is_caught_up());

    pool.set_peer_height(&"peer-a".to_string(), 8);
    assert!(!pool.is_caught_up());
    assert_eq!(pool.max_peer_height(), 8);

    pool.make_next_requests();
    let requests = drain_requests(&mut requests_rx);
    for request in &requests {
        assert!(pool.add_block(make_block(request.height), &request.peer_id));
    }
    for _ in 5..=8 {
        pool.pop_request();
    }
    assert!(pool.is_caught_up(), "base beyond best peer height");
}
