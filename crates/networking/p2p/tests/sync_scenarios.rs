//! End-to-end fast-sync runs against scripted in-process peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ember_common::H256;
use ember_common::U256;
use ember_common::types::{
    BlockBody, BlockHash, BlockHeader, compute_ommers_hash, compute_receipts_root,
    compute_transactions_root,
};
use ember_p2p::config::SyncConfig;
use ember_p2p::connection::{OutboundRequest, PeerConnection};
use ember_p2p::messages::{BlockBodies, BlockHeaders, HashOrNumber, Message, NodeData, Receipts};
use ember_p2p::peer_table::{Peer, PeerId, PeerTable};
use ember_p2p::sync::FastSync;
use ember_p2p::sync_state::SyncState;
use ember_storage::{EngineType, Store};
use ember_trie::EMPTY_TRIE_ROOT;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> SyncConfig {
    SyncConfig {
        block_headers_per_request: 50,
        block_bodies_per_request: 20,
        receipts_per_request: 20,
        nodes_per_request: 10,
        max_concurrent_requests: 10,
        fast_sync_throttle: Duration::from_millis(5),
        peer_response_timeout: Duration::from_millis(500),
        sync_retry_interval: Duration::from_millis(25),
        blacklist_duration: Duration::from_secs(60),
        critical_blacklist_duration: Duration::from_secs(120),
        pivot_block_offset: 20,
        max_pivot_block_age: 96,
        max_target_difference: 5,
        min_peers_to_choose_pivot_block: 2,
        pivot_block_reschedule_interval: Duration::from_millis(50),
        maximum_target_update_failures: 5,
        fast_sync_block_validation_n: 10,
        fast_sync_block_validation_k: 10,
        fast_sync_block_validation_x: 5,
        persist_state_snapshot_interval: Duration::from_millis(100),
        print_status_interval: Duration::from_secs(5),
        state_sync_bloom_filter_size: 1 << 16,
    }
}

/// A chain of empty blocks that passes structural header validation.
fn build_chain(tip: u64) -> Vec<BlockHeader> {
    let empty_body = BlockBody::default();
    let transactions_root = compute_transactions_root(&empty_body.transactions);
    let ommers_hash = compute_ommers_hash(&empty_body.ommers);
    let receipts_root = compute_receipts_root(&[]);

    let mut chain = Vec::with_capacity(tip as usize + 1);
    let mut parent_hash = H256::zero();
    for number in 0..=tip {
        let header = BlockHeader {
            parent_hash,
            ommers_hash,
            transactions_root,
            receipts_root,
            state_root: EMPTY_TRIE_ROOT,
            difficulty: U256::from(131_072u64),
            number,
            gas_limit: 8_000_000,
            gas_used: 0,
            timestamp: 1_000 + number * 15,
            ..Default::default()
        };
        parent_hash = header.hash();
        chain.push(header);
    }
    chain
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerBehavior {
    Honest,
    /// Breaks the parent link of the 10th header in any multi-header batch.
    CorruptHeaderBatches,
    /// Serves bodies that do not match their headers.
    InvalidBodies,
}

fn spawn_scripted_peer(chain: Arc<Vec<BlockHeader>>, behavior: PeerBehavior) -> PeerConnection {
    let (connection, receiver) = PeerConnection::channel();
    tokio::spawn(serve_peer(chain, behavior, receiver));
    connection
}

async fn serve_peer(
    chain: Arc<Vec<BlockHeader>>,
    behavior: PeerBehavior,
    mut receiver: mpsc::UnboundedReceiver<OutboundRequest>,
) {
    let by_hash: HashMap<BlockHash, BlockHeader> =
        chain.iter().map(|h| (h.hash(), h.clone())).collect();
    while let Some(OutboundRequest { message, reply }) = receiver.recv().await {
        let id = message.request_id();
        let response = match message {
            Message::GetBlockHeaders(req) => {
                let start = match req.startblock {
                    HashOrNumber::Number(number) => number,
                    HashOrNumber::Hash(hash) => match by_hash.get(&hash) {
                        Some(header) => header.number,
                        None => continue,
                    },
                };
                let mut headers: Vec<BlockHeader> = (start..start + req.limit)
                    .filter_map(|number| chain.get(number as usize).cloned())
                    .collect();
                if behavior == PeerBehavior::CorruptHeaderBatches && headers.len() > 9 {
                    headers[9].parent_hash = H256::repeat_byte(0xee);
                }
                Message::BlockHeaders(BlockHeaders {
                    id,
                    block_headers: headers,
                })
            }
            Message::GetBlockBodies(req) => {
                let block_bodies = req
                    .block_hashes
                    .iter()
                    .filter(|hash| by_hash.contains_key(*hash))
                    .map(|_| match behavior {
                        PeerBehavior::InvalidBodies => BlockBody {
                            transactions: vec![Default::default()],
                            ommers: vec![],
                        },
                        _ => BlockBody::default(),
                    })
                    .collect();
                Message::BlockBodies(BlockBodies { id, block_bodies })
            }
            Message::GetReceipts(req) => Message::Receipts(Receipts {
                id,
                receipts: req.block_hashes.iter().map(|_| vec![]).collect(),
            }),
            Message::GetNodeData(_req) => Message::NodeData(NodeData { id, nodes: vec![] }),
            _ => continue,
        };
        let _ = reply.send(response);
    }
}

fn add_peer(
    table: &PeerTable,
    byte: u8,
    tip: u64,
    chain: Arc<Vec<BlockHeader>>,
    behavior: PeerBehavior,
) -> PeerId {
    let id = PeerId::repeat_byte(byte);
    let addr: SocketAddr = format!("127.0.0.1:3030{byte}").parse().unwrap();
    let connection = spawn_scripted_peer(chain, behavior);
    table
        .insert_peer(
            Peer {
                id,
                addr,
                connection,
            },
            tip,
        )
        .unwrap();
    id
}

async fn await_completion(done: tokio::sync::oneshot::Receiver<Result<(), ember_p2p::error::SyncError>>) {
    tokio::time::timeout(Duration::from_secs(30), done)
        .await
        .expect("fast sync did not complete in time")
        .expect("coordinator dropped the completion channel")
        .expect("fast sync reported an error");
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_sync_completes_against_honest_peers() {
    init_tracing();
    let chain = Arc::new(build_chain(120));
    let store = Store::new(EngineType::InMemory).unwrap();
    store.init_genesis(chain[0].clone()).await.unwrap();

    let table = PeerTable::new();
    for byte in [0x01u8, 0x02, 0x03] {
        add_peer(&table, byte, 120, chain.clone(), PeerBehavior::Honest);
    }

    let (_handle, done) = FastSync::spawn(store.clone(), table, test_config());
    await_completion(done).await;

    assert!(store.is_fast_sync_done().await.unwrap());
    // Pivot is advertised tip minus offset
    let pivot = 120 - 20;
    let pivot_header = store
        .get_block_header_by_number(pivot)
        .await
        .unwrap()
        .expect("pivot header must be stored");
    assert_eq!(pivot_header.hash(), chain[pivot as usize].hash());
    let pivot_hash = pivot_header.hash();
    assert!(store.get_block_body(pivot_hash).await.unwrap().is_some());
    assert!(store.get_receipts(pivot_hash).await.unwrap().is_some());
    // The unvalidated tail past the pivot was discarded on finish
    assert!(
        store
            .get_block_header_by_number(pivot + 3)
            .await
            .unwrap()
            .is_none()
    );
    // The sync-state record is gone once the done marker exists
    assert!(store.load_sync_state_blob().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_fork_header_batch_blacklists_the_peer() {
    init_tracing();
    let chain = Arc::new(build_chain(121));
    let store = Store::new(EngineType::InMemory).unwrap();
    store.init_genesis(chain[0].clone()).await.unwrap();

    let table = PeerTable::new();
    // The liar advertises the highest tip, so it gets the header requests
    // first
    let liar = add_peer(
        &table,
        0x01,
        121,
        chain.clone(),
        PeerBehavior::CorruptHeaderBatches,
    );
    add_peer(&table, 0x02, 120, chain.clone(), PeerBehavior::Honest);
    add_peer(&table, 0x03, 120, chain.clone(), PeerBehavior::Honest);

    let (_handle, done) = FastSync::spawn(store.clone(), table.clone(), test_config());
    await_completion(done).await;

    assert!(store.is_fast_sync_done().await.unwrap());
    assert!(table.is_blacklisted(&liar).unwrap());
    assert_eq!(
        table.blacklist_reason(&liar).unwrap().as_deref(),
        Some("error in block headers response")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_bodies_are_never_stored() {
    init_tracing();
    let chain = Arc::new(build_chain(120));
    let store = Store::new(EngineType::InMemory).unwrap();
    store.init_genesis(chain[0].clone()).await.unwrap();

    let table = PeerTable::new();
    add_peer(&table, 0x01, 120, chain.clone(), PeerBehavior::InvalidBodies);
    add_peer(&table, 0x02, 120, chain.clone(), PeerBehavior::Honest);

    let (_handle, done) = FastSync::spawn(store.clone(), table, test_config());
    await_completion(done).await;

    // Every stored body matches its header, the tampered ones were rejected
    // and re-fetched
    let pivot = 120 - 20;
    for number in 1..=pivot {
        let hash = chain[number as usize].hash();
        if let Some(body) = store.get_block_body(hash).await.unwrap() {
            assert_eq!(body, BlockBody::default(), "block {number}");
        }
    }
    assert!(store.is_fast_sync_done().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_sync_with_complete_blockchain_needs_no_peers() {
    init_tracing();
    // A previous run downloaded everything up to the target and persisted
    // its state just before the state download finished.
    let config = test_config();
    let chain = build_chain(105);
    let store = Store::new(EngineType::InMemory).unwrap();
    store.init_genesis(chain[0].clone()).await.unwrap();
    for header in &chain[1..] {
        let parent_weight = store
            .get_parent_chain_weight(header)
            .await
            .unwrap()
            .unwrap();
        store
            .persist_header(header.clone(), parent_weight)
            .await
            .unwrap();
        let hash = header.hash();
        store
            .store_blocks(vec![hash], vec![BlockBody::default()])
            .await
            .unwrap();
        store.store_receipts(vec![(hash, vec![])]).await.unwrap();
    }

    let mut state = SyncState::new(chain[100].clone(), config.fast_sync_block_validation_x);
    state.best_block_header_number = 105;
    state.last_full_block_number = 105;
    state.next_block_to_fully_validate = 106;
    store
        .persist_sync_state_blob(state.encode())
        .await
        .unwrap();

    let (_handle, done) = FastSync::spawn(store.clone(), PeerTable::new(), config);
    await_completion(done).await;

    assert!(store.is_fast_sync_done().await.unwrap());
    // Nothing below the pivot was touched
    assert!(
        store
            .get_block_header_by_number(100)
            .await
            .unwrap()
            .is_some()
    );
    // The momentum tail is discarded
    assert!(
        store
            .get_block_header_by_number(104)
            .await
            .unwrap()
            .is_none()
    );
}
