use std::collections::VecDeque;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, InitResult::Success, send_interval},
};
use tracing::{debug, trace, warn};

use ember_common::H256;
use ember_common::types::{AccountState, BlockNumber, EMPTY_CODE_HASH};
use ember_common::utils::keccak;
use ember_rlp::decode::RLPDecode;
use ember_storage::Store;
use ember_trie::{EMPTY_TRIE_ROOT, Node};

use crate::bloom::BloomFilter;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::messages::{GetNodeData, Message, MessageKind};
use crate::peer_table::{PeerId, PeerTable};
use crate::requests::{RequestFailure, RequestOutcome, spawn_request};
use crate::sync::{FastSync, InMessage as SyncInMessage};

/// What a missing hash refers to, which decides how a retrieved blob is
/// walked for further references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    StateTrie,
    StorageTrie,
    Code,
}

#[derive(Debug, Clone)]
pub enum InMessage {
    /// Initialises (or re-initialises after `Restart`) the frontier at the
    /// given state root.
    Start {
        root: H256,
        block_number: BlockNumber,
    },
    NodeData {
        peer_id: PeerId,
        nodes: Vec<Bytes>,
    },
    RequestFailed {
        peer_id: PeerId,
        reason: RequestFailure,
    },
    /// Cooperative cancel ahead of a pivot change. Already-stored nodes are
    /// kept; the next `Start` walks past them.
    Restart,
    EmitStats,
}

#[derive(Debug, Clone)]
pub enum OutMessage {
    Done,
}

/// Downloads the world-state trie rooted at the pivot's state root: keeps a
/// frontier of missing node hashes, batches them across idle peers, walks
/// retrieved nodes for child references, and reports completion to the sync
/// coordinator. Single writer of the trie-node key space.
#[derive(Debug)]
pub struct StateScheduler {
    store: Store,
    peer_table: PeerTable,
    coordinator: GenServerHandle<FastSync>,
    config: SyncConfig,
    active: bool,
    root: H256,
    block_number: BlockNumber,
    frontier: VecDeque<(H256, NodeKind)>,
    /// Hashes queued or in flight, to avoid enqueueing one twice.
    pending: FxHashSet<H256>,
    /// Prefilter over nodes already written to storage.
    known_filter: BloomFilter,
    in_flight: FxHashMap<PeerId, Vec<(H256, NodeKind)>>,
    downloaded_nodes_count: u64,
    total_nodes_count: u64,
}

impl StateScheduler {
    pub fn spawn(
        store: Store,
        peer_table: PeerTable,
        coordinator: GenServerHandle<FastSync>,
        config: SyncConfig,
    ) -> GenServerHandle<StateScheduler> {
        let known_filter = BloomFilter::new(config.state_sync_bloom_filter_size);
        let state = StateScheduler {
            store,
            peer_table,
            coordinator,
            config,
            active: false,
            root: H256::zero(),
            block_number: 0,
            frontier: VecDeque::new(),
            pending: FxHashSet::default(),
            known_filter,
            in_flight: FxHashMap::default(),
            downloaded_nodes_count: 0,
            total_nodes_count: 0,
        };
        state.start()
    }

    async fn start_syncing(
        &mut self,
        root: H256,
        block_number: BlockNumber,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), SyncError> {
        debug!(%root, block_number, "Starting state sync");
        self.root = root;
        self.block_number = block_number;
        self.frontier.clear();
        self.pending.clear();
        self.active = true;

        if root == EMPTY_TRIE_ROOT {
            debug!("Pivot has an empty state root, state sync is trivially complete");
            self.finish().await;
            return Ok(());
        }

        self.seed_frontier(root).await?;
        self.dispatch_requests(handle)?;
        self.check_completion().await;
        Ok(())
    }

    /// Walks whatever part of the trie is already stored and queues the
    /// missing cut. After a crash or a pivot rebase this skips everything
    /// persisted by earlier runs.
    async fn seed_frontier(&mut self, root: H256) -> Result<(), SyncError> {
        let mut stack = vec![(root, NodeKind::StateTrie)];
        while let Some((hash, kind)) = stack.pop() {
            if kind == NodeKind::Code {
                self.enqueue_if_missing(hash, kind).await?;
                continue;
            }
            match self.maybe_stored(&hash).await? {
                Some(blob) => {
                    self.known_filter.insert(&hash);
                    stack.extend(node_children(&blob, kind));
                }
                None => self.enqueue_if_missing(hash, kind).await?,
            }
        }
        Ok(())
    }

    /// Storage lookup behind the bloom prefilter: a negative filter answer
    /// means the node cannot be stored, so the engine is not queried.
    async fn maybe_stored(&self, hash: &H256) -> Result<Option<Bytes>, SyncError> {
        if !self.known_filter.contains(hash) {
            return Ok(None);
        }
        Ok(self.store.get_state_node(*hash).await?)
    }

    async fn enqueue_if_missing(&mut self, hash: H256, kind: NodeKind) -> Result<(), SyncError> {
        if self.pending.contains(&hash) {
            return Ok(());
        }
        if self.maybe_stored(&hash).await?.is_some() {
            return Ok(());
        }
        self.pending.insert(hash);
        self.frontier.push_back((hash, kind));
        self.total_nodes_count += 1;
        Ok(())
    }

    fn dispatch_requests(&mut self, handle: &GenServerHandle<Self>) -> Result<(), SyncError> {
        if !self.active {
            return Ok(());
        }
        let peers = self.peer_table.peers_to_download_from()?;
        for (peer, _info) in peers {
            if self.frontier.is_empty() {
                break;
            }
            if self.in_flight.len() >= self.config.max_concurrent_requests {
                break;
            }
            if self.in_flight.contains_key(&peer.id) {
                continue;
            }
            let batch_size = self.config.nodes_per_request.min(self.frontier.len());
            let batch: Vec<(H256, NodeKind)> = self.frontier.drain(..batch_size).collect();
            let node_hashes: Vec<H256> = batch.iter().map(|(hash, _)| *hash).collect();
            trace!(peer_id = %peer.id, count = node_hashes.len(), "Requesting state nodes");
            self.in_flight.insert(peer.id, batch);
            let request = Message::GetNodeData(GetNodeData {
                id: rand::random(),
                node_hashes,
            });
            spawn_request(
                handle.clone(),
                peer,
                request,
                MessageKind::NodeData,
                self.config.peer_response_timeout,
                |outcome| match outcome {
                    RequestOutcome::Response {
                        peer_id,
                        message: Message::NodeData(node_data),
                        ..
                    } => InMessage::NodeData {
                        peer_id,
                        nodes: node_data.nodes,
                    },
                    RequestOutcome::Response { peer_id, .. } => InMessage::RequestFailed {
                        peer_id,
                        reason: RequestFailure::UnexpectedResponse,
                    },
                    RequestOutcome::Failed { peer_id, reason } => {
                        InMessage::RequestFailed { peer_id, reason }
                    }
                },
            );
        }
        Ok(())
    }

    async fn handle_node_data(
        &mut self,
        peer_id: PeerId,
        nodes: Vec<Bytes>,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), SyncError> {
        let Some(assigned) = self.in_flight.remove(&peer_id) else {
            // A response that survived a restart; the new frontier does not
            // know it, so it is dropped.
            trace!(peer_id = %peer_id, "Dropping node data response with no matching request");
            return Ok(());
        };

        if nodes.is_empty() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "empty node data response",
            )?;
            self.requeue(assigned);
            self.dispatch_requests(handle)?;
            return Ok(());
        }

        let mut expected: FxHashMap<H256, NodeKind> = assigned.iter().copied().collect();
        let mut violation = false;
        for blob in nodes {
            let hash = keccak(&blob);
            let Some(kind) = expected.remove(&hash) else {
                violation = true;
                continue;
            };
            self.insert_node(hash, kind, blob).await?;
        }

        if violation {
            self.peer_table.blacklist(
                &peer_id,
                self.config.critical_blacklist_duration,
                "node data does not hash to the requested key",
            )?;
        }
        // Anything the peer did not answer goes back on the frontier
        self.requeue(expected.into_iter().collect());

        self.dispatch_requests(handle)?;
        self.check_completion().await;
        Ok(())
    }

    async fn insert_node(
        &mut self,
        hash: H256,
        kind: NodeKind,
        blob: Bytes,
    ) -> Result<(), SyncError> {
        for (child, child_kind) in node_children(&blob, kind) {
            self.enqueue_if_missing(child, child_kind).await?;
        }
        self.store.put_state_node(hash, blob).await?;
        self.known_filter.insert(&hash);
        self.pending.remove(&hash);
        self.downloaded_nodes_count += 1;
        Ok(())
    }

    fn requeue(&mut self, entries: Vec<(H256, NodeKind)>) {
        for entry in entries.into_iter().rev() {
            self.frontier.push_front(entry);
        }
    }

    async fn handle_request_failed(
        &mut self,
        peer_id: PeerId,
        reason: RequestFailure,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), SyncError> {
        debug!(peer_id = %peer_id, %reason, "State node request failed");
        if let Some(assigned) = self.in_flight.remove(&peer_id) {
            self.requeue(assigned);
        }
        self.dispatch_requests(handle)?;
        Ok(())
    }

    fn restart(&mut self) {
        debug!("State sync restart requested, waiting for a new root");
        self.active = false;
        self.frontier.clear();
        self.pending.clear();
        // In-flight responses arriving after this point find no matching
        // request and are dropped; stored nodes stay usable for the new root.
        self.in_flight.clear();
    }

    fn missing_count(&self) -> u64 {
        let in_flight: usize = self.in_flight.values().map(Vec::len).sum();
        (self.frontier.len() + in_flight) as u64
    }

    async fn check_completion(&mut self) {
        if self.active && self.frontier.is_empty() && self.in_flight.is_empty() {
            self.finish().await;
        }
    }

    async fn finish(&mut self) {
        debug!(
            root = %self.root,
            block_number = self.block_number,
            downloaded = self.downloaded_nodes_count,
            "State sync finished"
        );
        self.active = false;
        let mut coordinator = self.coordinator.clone();
        let _ = coordinator.cast(SyncInMessage::StateSyncFinished).await;
    }

    async fn emit_stats(&mut self) {
        if !self.active {
            return;
        }
        let mut coordinator = self.coordinator.clone();
        let _ = coordinator
            .cast(SyncInMessage::StateSyncStats {
                saved: self.downloaded_nodes_count,
                missing: self.missing_count(),
            })
            .await;
    }
}

/// Hash references a retrieved blob makes to further downloads. Trie nodes
/// contribute their children; account leaves additionally reference the
/// account's storage trie and code. Code blobs reference nothing.
fn node_children(blob: &[u8], kind: NodeKind) -> Vec<(H256, NodeKind)> {
    if kind == NodeKind::Code {
        return Vec::new();
    }
    let node = match Node::decode(blob) {
        Ok(node) => node,
        Err(err) => {
            // The blob is authentic (it hashed to its key), so this points
            // at a node layout we do not model
            warn!(%err, "Failed to decode a retrieved trie node");
            return Vec::new();
        }
    };
    let mut children: Vec<(H256, NodeKind)> = node
        .child_hashes()
        .into_iter()
        .map(|hash| (hash, kind))
        .collect();
    if kind == NodeKind::StateTrie {
        for value in node.values() {
            let Ok(account) = AccountState::decode(value) else {
                continue;
            };
            if account.storage_root != EMPTY_TRIE_ROOT {
                children.push((account.storage_root, NodeKind::StorageTrie));
            }
            if account.code_hash != EMPTY_CODE_HASH {
                children.push((account.code_hash, NodeKind::Code));
            }
        }
    }
    children
}

impl GenServer for StateScheduler {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = SyncError;

    async fn init(
        self,
        handle: &GenServerHandle<Self>,
    ) -> Result<spawned_concurrency::tasks::InitResult<Self>, Self::Error> {
        send_interval(
            self.config.print_status_interval,
            handle.clone(),
            InMessage::EmitStats,
        );
        Ok(Success(self))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::Start { root, block_number } => {
                let _ = self
                    .start_syncing(root, block_number, handle)
                    .await
                    .inspect_err(|err| warn!(%err, "Failed to start state sync"));
            }
            InMessage::NodeData { peer_id, nodes } => {
                let _ = self
                    .handle_node_data(peer_id, nodes, handle)
                    .await
                    .inspect_err(|err| warn!(%err, "Failed to process node data"));
            }
            InMessage::RequestFailed { peer_id, reason } => {
                let _ = self
                    .handle_request_failed(peer_id, reason, handle)
                    .await
                    .inspect_err(|err| warn!(%err, "Failed to recover from request failure"));
            }
            InMessage::Restart => self.restart(),
            InMessage::EmitStats => self.emit_stats().await,
        }
        CastResponse::NoReply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::U256;
    use ember_rlp::encode::RLPEncode;
    use ember_rlp::structs::Encoder;
    use ember_trie::Nibbles;

    fn leaf_with_account(account: &AccountState) -> (H256, Bytes) {
        let mut blob = Vec::new();
        Encoder::new(&mut blob)
            .encode_field(
                &Nibbles::from_raw(vec![0x1, 0x2])
                    .compact_encode(true)
                    .as_slice(),
            )
            .encode_field(&account.encode_to_vec().as_slice())
            .finish();
        (keccak(&blob), Bytes::from(blob))
    }

    #[test]
    fn account_leaf_references_storage_and_code() {
        let account = AccountState {
            nonce: 1,
            balance: U256::from(10u64),
            storage_root: H256::repeat_byte(0x5a),
            code_hash: H256::repeat_byte(0xc0),
        };
        let (_, blob) = leaf_with_account(&account);
        let children = node_children(&blob, NodeKind::StateTrie);
        assert!(children.contains(&(account.storage_root, NodeKind::StorageTrie)));
        assert!(children.contains(&(account.code_hash, NodeKind::Code)));
    }

    #[test]
    fn empty_account_references_nothing() {
        let account = AccountState {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_TRIE_ROOT,
            code_hash: EMPTY_CODE_HASH,
        };
        let (_, blob) = leaf_with_account(&account);
        assert!(node_children(&blob, NodeKind::StateTrie).is_empty());
    }

    #[test]
    fn storage_leaves_are_not_scanned_for_accounts() {
        let account = AccountState {
            nonce: 1,
            balance: U256::from(10u64),
            storage_root: H256::repeat_byte(0x5a),
            code_hash: H256::repeat_byte(0xc0),
        };
        let (_, blob) = leaf_with_account(&account);
        assert!(node_children(&blob, NodeKind::StorageTrie).is_empty());
    }

    #[test]
    fn code_blobs_reference_nothing() {
        assert!(node_children(&[0xde, 0xad, 0xbe, 0xef], NodeKind::Code).is_empty());
    }
}
