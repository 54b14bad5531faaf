use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use rand::Rng;
use spawned_concurrency::{
    messages::Unused,
    tasks::{
        CastResponse, GenServer, GenServerHandle, InitResult::Success, send_after, send_interval,
    },
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use ember_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber, Receipt};
use ember_storage::Store;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::messages::{
    GetBlockBodies, GetBlockHeaders, GetReceipts, HashOrNumber, Message, MessageKind,
};
use crate::peer_table::{Peer, PeerId, PeerInfo, PeerTable};
use crate::pivot::spawn_pivot_selection;
use crate::requests::{RequestFailure, RequestOutcome, spawn_request};
use crate::state_scheduler::{InMessage as SchedulerInMessage, StateScheduler};
use crate::sync_state::SyncState;
use crate::validator::{BlockValidationResult, BlockValidator, headers_chained};

/// Why the coordinator is waiting for a fresh pivot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotUpdateReason {
    /// The header at the safe download target was imported.
    ImportedLastBlock,
    /// A rewind crossed the pivot, its chain can no longer be trusted.
    LastBlockValidationFailed,
    /// The pivot fell too far behind the network tip.
    SyncRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    Initialising,
    Syncing,
    WaitingForPivotBlockUpdate(PivotUpdateReason),
}

/// Which download a peer is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Headers,
    Bodies,
    Receipts,
}

#[derive(Debug, Clone)]
pub enum InMessage {
    /// Heartbeat: drive the state machine.
    ProcessSyncing,
    PrintStatus,
    PersistSyncState,
    /// Retry trigger scheduled after a rejected or failed pivot selection.
    SelectPivot,
    PeerHandshaked {
        peer: Peer,
        max_block_number: BlockNumber,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    BlockHeadersReceived {
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
    },
    BlockBodiesReceived {
        peer_id: PeerId,
        bodies: Vec<BlockBody>,
    },
    ReceiptsReceived {
        peer_id: PeerId,
        receipts: Vec<Vec<Receipt>>,
    },
    RequestFailed {
        peer_id: PeerId,
        kind: RequestKind,
        reason: RequestFailure,
    },
    PivotSelected {
        header: BlockHeader,
    },
    PivotSelectionFailed,
    StateSyncFinished,
    StateSyncStats {
        saved: u64,
        missing: u64,
    },
}

#[derive(Debug, Clone)]
pub enum OutMessage {
    Done,
}

/// The fast-sync orchestrator. Owns the `SyncState` record, hands work to
/// per-request handlers, feeds accepted data to storage, and drives the
/// pivot-update state machine. All mutation happens on this agent's task.
#[derive(Debug)]
pub struct FastSync {
    store: Store,
    peer_table: PeerTable,
    validator: BlockValidator,
    config: SyncConfig,
    status: SyncStatus,
    state: Option<SyncState>,
    scheduler: Option<GenServerHandle<StateScheduler>>,
    /// Peers currently serving a request, and what they serve.
    assigned: HashMap<PeerId, RequestKind>,
    /// The single outstanding header request: peer and first requested number.
    requested_headers: Option<(PeerId, BlockNumber)>,
    requested_bodies: HashMap<PeerId, Vec<BlockHash>>,
    requested_receipts: HashMap<PeerId, Vec<BlockHash>>,
    last_request_at: HashMap<PeerId, Instant>,
    pivot_selection_in_flight: bool,
    state_sync_started: bool,
    already_done: bool,
    completion: Option<oneshot::Sender<Result<(), SyncError>>>,
}

impl FastSync {
    /// Starts the coordinator. The returned receiver resolves when fast sync
    /// has completed and the done marker is persisted.
    pub fn spawn(
        store: Store,
        peer_table: PeerTable,
        config: SyncConfig,
    ) -> (
        GenServerHandle<FastSync>,
        oneshot::Receiver<Result<(), SyncError>>,
    ) {
        info!("Starting block synchronization (fast mode)");
        let (completion_tx, completion_rx) = oneshot::channel();
        let state = FastSync {
            validator: BlockValidator::new(store.clone()),
            store,
            peer_table,
            config,
            status: SyncStatus::Initialising,
            state: None,
            scheduler: None,
            assigned: HashMap::new(),
            requested_headers: None,
            requested_bodies: HashMap::new(),
            requested_receipts: HashMap::new(),
            last_request_at: HashMap::new(),
            pivot_selection_in_flight: false,
            state_sync_started: false,
            already_done: false,
            completion: Some(completion_tx),
        };
        (state.start(), completion_rx)
    }

    // --- state machine -----------------------------------------------------

    async fn process_syncing(
        &mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        if self.already_done {
            info!("Fast sync was already completed on a previous run");
            if let Some(done) = self.completion.take() {
                let _ = done.send(Ok(()));
            }
            return Ok(CastResponse::Stop);
        }
        let (fully_synced, queues_done, state_sync_finished) = {
            let Some(state) = self.state.as_ref() else {
                // Still waiting for the initial pivot
                return Ok(CastResponse::NoReply);
            };
            (
                self.fully_synced(state),
                self.blockchain_queues_done(state),
                state.state_sync_finished,
            )
        };

        if fully_synced {
            return self.finish().await;
        }
        if !queues_done {
            if self.status == SyncStatus::Syncing {
                self.process_downloads(handle)?;
            }
        } else if !state_sync_finished
            && !matches!(self.status, SyncStatus::WaitingForPivotBlockUpdate(_))
        {
            if !self.state_sync_started {
                self.start_state_sync().await;
            } else if self.pivot_block_is_stale()? {
                info!("Pivot block is stale, restarting state sync on a newer pivot");
                if let Some(scheduler) = &self.scheduler {
                    let _ = scheduler.clone().cast(SchedulerInMessage::Restart).await;
                }
                self.state_sync_started = false;
                self.update_pivot_block(PivotUpdateReason::SyncRestart, handle);
            }
        } else {
            trace!("No pending blockchain work, waiting for responses");
        }
        Ok(CastResponse::NoReply)
    }

    /// Headers reached the target and both download queues drained.
    fn blockchain_queues_done(&self, state: &SyncState) -> bool {
        state.best_block_header_number >= state.safe_download_target
            && state.block_bodies_queue.is_empty()
            && state.receipts_queue.is_empty()
    }

    fn fully_synced(&self, state: &SyncState) -> bool {
        self.blockchain_queues_done(state) && self.assigned.is_empty() && state.state_sync_finished
    }

    /// True when enough peers advertise tips far enough past the pivot that
    /// a fresh pivot would land `max_pivot_block_age` blocks ahead.
    fn pivot_block_is_stale(&self) -> Result<bool, SyncError> {
        let Some(pivot_number) = self.state.as_ref().map(|s| s.pivot_block.number) else {
            return Ok(false);
        };
        let ahead = self
            .peer_table
            .handshaked_peers()?
            .iter()
            .filter(|(_, info)| {
                info.max_block_number
                    .saturating_sub(self.config.pivot_block_offset)
                    .saturating_sub(pivot_number)
                    >= self.config.max_pivot_block_age
            })
            .count();
        Ok(ahead >= self.config.min_peers_to_choose_pivot_block)
    }

    async fn start_state_sync(&mut self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let root = state.pivot_block.state_root;
        let block_number = state.pivot_block.number;
        info!(%root, block_number, "Starting state download at the pivot block");
        if let Some(scheduler) = &self.scheduler {
            let _ = scheduler
                .clone()
                .cast(SchedulerInMessage::Start { root, block_number })
                .await;
        }
        self.state_sync_started = true;
    }

    async fn finish(&mut self) -> Result<CastResponse, SyncError> {
        let Some(state) = self.state.as_ref() else {
            return Ok(CastResponse::NoReply);
        };
        // Headers past the pivot exist only to carry validation momentum
        // through it; they are not part of the synced chain.
        let tail = self.config.fast_sync_block_validation_x.saturating_sub(1);
        self.store
            .discard_last_blocks(state.best_block_header_number, tail)
            .await?;
        self.store.persist_fast_sync_done().await?;
        info!(
            pivot = state.pivot_block.number,
            "Block synchronization in fast mode finished, switching to regular mode"
        );
        if let Some(done) = self.completion.take() {
            let _ = done.send(Ok(()));
        }
        Ok(CastResponse::Stop)
    }

    // --- work assignment ---------------------------------------------------

    fn process_downloads(&mut self, handle: &GenServerHandle<Self>) -> Result<(), SyncError> {
        let mut peers = self.peer_table.peers_to_download_from()?;
        if peers.is_empty() {
            debug!("There are no available peers to download from");
            return Ok(());
        }
        let now = Instant::now();
        peers.retain(|(peer, _)| !self.assigned.contains_key(&peer.id));
        peers.retain(|(peer, _)| {
            self.last_request_at
                .get(&peer.id)
                .is_none_or(|at| now.duration_since(*at) >= self.config.fast_sync_throttle)
        });
        peers.sort_by(|a, b| b.1.max_block_number.cmp(&a.1.max_block_number));
        for (peer, info) in peers {
            if self.assigned.len() >= self.config.max_concurrent_requests {
                break;
            }
            self.assign_blockchain_work(peer, info, handle);
        }
        Ok(())
    }

    /// Receipts starve bodies, bodies starve headers: the queues closest to
    /// completing full blocks are drained first.
    fn assign_blockchain_work(
        &mut self,
        peer: Peer,
        info: PeerInfo,
        handle: &GenServerHandle<Self>,
    ) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if !state.receipts_queue.is_empty() {
            let count = self
                .config
                .receipts_per_request
                .min(state.receipts_queue.len());
            let hashes: Vec<BlockHash> = state.receipts_queue.drain(..count).collect();
            self.assigned.insert(peer.id, RequestKind::Receipts);
            self.requested_receipts.insert(peer.id, hashes.clone());
            self.last_request_at.insert(peer.id, Instant::now());
            trace!(peer_id = %peer.id, count = hashes.len(), "Requesting receipts");
            spawn_request(
                handle.clone(),
                peer,
                Message::GetReceipts(GetReceipts {
                    id: rand::random(),
                    block_hashes: hashes,
                }),
                MessageKind::Receipts,
                self.config.peer_response_timeout,
                |outcome| match outcome {
                    RequestOutcome::Response {
                        peer_id,
                        message: Message::Receipts(msg),
                        ..
                    } => InMessage::ReceiptsReceived {
                        peer_id,
                        receipts: msg.receipts,
                    },
                    RequestOutcome::Response { peer_id, .. } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Receipts,
                        reason: RequestFailure::UnexpectedResponse,
                    },
                    RequestOutcome::Failed { peer_id, reason } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Receipts,
                        reason,
                    },
                },
            );
        } else if !state.block_bodies_queue.is_empty() {
            let count = self
                .config
                .block_bodies_per_request
                .min(state.block_bodies_queue.len());
            let hashes: Vec<BlockHash> = state.block_bodies_queue.drain(..count).collect();
            self.assigned.insert(peer.id, RequestKind::Bodies);
            self.requested_bodies.insert(peer.id, hashes.clone());
            self.last_request_at.insert(peer.id, Instant::now());
            trace!(peer_id = %peer.id, count = hashes.len(), "Requesting block bodies");
            spawn_request(
                handle.clone(),
                peer,
                Message::GetBlockBodies(GetBlockBodies {
                    id: rand::random(),
                    block_hashes: hashes,
                }),
                MessageKind::BlockBodies,
                self.config.peer_response_timeout,
                |outcome| match outcome {
                    RequestOutcome::Response {
                        peer_id,
                        message: Message::BlockBodies(msg),
                        ..
                    } => InMessage::BlockBodiesReceived {
                        peer_id,
                        bodies: msg.block_bodies,
                    },
                    RequestOutcome::Response { peer_id, .. } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Bodies,
                        reason: RequestFailure::UnexpectedResponse,
                    },
                    RequestOutcome::Failed { peer_id, reason } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Bodies,
                        reason,
                    },
                },
            );
        } else if self.requested_headers.is_none()
            && state.best_block_header_number < state.safe_download_target
            && info.max_block_number >= state.pivot_block.number
        {
            let start = state.best_block_header_number + 1;
            let limit = self
                .config
                .block_headers_per_request
                .min(state.safe_download_target - state.best_block_header_number);
            self.assigned.insert(peer.id, RequestKind::Headers);
            self.requested_headers = Some((peer.id, start));
            self.last_request_at.insert(peer.id, Instant::now());
            trace!(peer_id = %peer.id, start, limit, "Requesting block headers");
            spawn_request(
                handle.clone(),
                peer,
                Message::GetBlockHeaders(GetBlockHeaders {
                    id: rand::random(),
                    startblock: HashOrNumber::Number(start),
                    limit,
                    skip: 0,
                    reverse: false,
                }),
                MessageKind::BlockHeaders,
                self.config.peer_response_timeout,
                |outcome| match outcome {
                    RequestOutcome::Response {
                        peer_id,
                        message: Message::BlockHeaders(msg),
                        ..
                    } => InMessage::BlockHeadersReceived {
                        peer_id,
                        headers: msg.block_headers,
                    },
                    RequestOutcome::Response { peer_id, .. } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Headers,
                        reason: RequestFailure::UnexpectedResponse,
                    },
                    RequestOutcome::Failed { peer_id, reason } => InMessage::RequestFailed {
                        peer_id,
                        kind: RequestKind::Headers,
                        reason,
                    },
                },
            );
        }
    }

    fn release_peer(&mut self, peer_id: &PeerId) {
        self.assigned.remove(peer_id);
    }

    // --- header handling ---------------------------------------------------

    async fn on_block_headers(
        &mut self,
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        self.release_peer(&peer_id);
        let expected_start = match self.requested_headers {
            Some((requested_peer, start)) if requested_peer == peer_id => {
                self.requested_headers = None;
                start
            }
            _ => {
                // A response from a request this run no longer tracks
                trace!(peer_id = %peer_id, "Dropping untracked block headers response");
                return self.process_syncing(handle).await;
            }
        };
        if self.state.is_none() || self.status != SyncStatus::Syncing {
            return self.process_syncing(handle).await;
        }

        if headers.is_empty() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "empty block headers response",
            )?;
        } else if headers[0].number != expected_start || !headers_chained(&headers) {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "error in block headers response",
            )?;
        } else {
            self.accept_headers(peer_id, headers, handle).await?;
        }
        self.process_syncing(handle).await
    }

    async fn accept_headers(
        &mut self,
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), SyncError> {
        for header in headers {
            let Some(state) = self.state.as_ref() else {
                return Ok(());
            };
            if header.number != state.best_block_header_number + 1 {
                // Re-processing an already accepted header is a no-op
                break;
            }

            if header.number >= state.next_block_to_fully_validate {
                let parent = match self.store.get_block_header(header.parent_hash).await? {
                    Some(parent) => parent,
                    None => {
                        warn!(
                            number = header.number,
                            "Parent of a header queued for validation is unknown"
                        );
                        self.handle_rewind(
                            &header,
                            peer_id,
                            self.config.blacklist_duration,
                            "unknown parent for header validation",
                            handle,
                        )
                        .await?;
                        return Ok(());
                    }
                };
                if let Err(err) = self.validator.validate_header(&header, &parent) {
                    warn!(number = header.number, %err, "Header failed full validation");
                    self.handle_rewind(
                        &header,
                        peer_id,
                        self.config.critical_blacklist_duration,
                        "block header validation failed",
                        handle,
                    )
                    .await?;
                    return Ok(());
                }
                let stride = self.config.fast_sync_block_validation_k.max(1);
                let jitter = rand::thread_rng().gen_range(1..=stride);
                if let Some(state) = self.state.as_mut() {
                    state.next_block_to_fully_validate = header.number + jitter;
                }
            }

            let Some(parent_weight) = self.store.get_parent_chain_weight(&header).await? else {
                warn!(
                    number = header.number,
                    "No chain weight for the header's parent, possibly a wrong fork"
                );
                self.handle_rewind(
                    &header,
                    peer_id,
                    self.config.blacklist_duration,
                    "unknown parent chain weight",
                    handle,
                )
                .await?;
                return Ok(());
            };

            let hash = header.hash();
            let number = header.number;
            self.store.persist_header(header, parent_weight).await?;
            let Some(state) = self.state.as_mut() else {
                return Ok(());
            };
            state.enqueue_block(hash);
            state.best_block_header_number = number;

            if number == state.safe_download_target {
                debug!(number, "Last block before the download target imported");
                self.update_pivot_block(PivotUpdateReason::ImportedLastBlock, handle);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Drops the last `fast_sync_block_validation_n` blocks below the failed
    /// header, bans the peer that served it, and re-enters pivot selection
    /// when the discard reaches below the pivot.
    async fn handle_rewind(
        &mut self,
        header: &BlockHeader,
        peer_id: PeerId,
        ban: std::time::Duration,
        reason: &str,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), SyncError> {
        self.peer_table.blacklist(&peer_id, ban, reason)?;
        let Some(state) = self.state.as_ref() else {
            return Ok(());
        };
        if header.number > state.safe_download_target {
            return Ok(());
        }
        let n = self.config.fast_sync_block_validation_n;
        self.store.discard_last_blocks(header.number, n).await?;
        let new_best = header.number.saturating_sub(n + 1);
        warn!(
            failed = header.number,
            new_best, "Rewinding the header chain after a validation failure"
        );

        let bodies_queue = self
            .filter_queue_to_stored(self.state.as_ref().map(|s| s.block_bodies_queue.clone()), new_best)
            .await?;
        let receipts_queue = self
            .filter_queue_to_stored(self.state.as_ref().map(|s| s.receipts_queue.clone()), new_best)
            .await?;
        let crossed_pivot = {
            let Some(state) = self.state.as_mut() else {
                return Ok(());
            };
            state.best_block_header_number = new_best;
            state.next_block_to_fully_validate =
                state.next_block_to_fully_validate.min(new_best + 1);
            state.block_bodies_queue = bodies_queue;
            state.receipts_queue = receipts_queue;
            new_best < state.pivot_block.number
        };
        if crossed_pivot {
            warn!("The rewind crossed the pivot block, selecting a new pivot");
            self.update_pivot_block(PivotUpdateReason::LastBlockValidationFailed, handle);
        }
        Ok(())
    }

    /// Keeps only the queued hashes whose headers survived a rewind.
    async fn filter_queue_to_stored(
        &self,
        queue: Option<VecDeque<BlockHash>>,
        max_number: BlockNumber,
    ) -> Result<VecDeque<BlockHash>, SyncError> {
        let mut kept = VecDeque::new();
        for hash in queue.unwrap_or_default() {
            if let Some(header) = self.store.get_block_header(hash).await?
                && header.number <= max_number
            {
                kept.push_back(hash);
            }
        }
        Ok(kept)
    }

    // --- body & receipt handling -------------------------------------------

    async fn on_block_bodies(
        &mut self,
        peer_id: PeerId,
        bodies: Vec<BlockBody>,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        self.release_peer(&peer_id);
        let hashes = self.requested_bodies.remove(&peer_id).unwrap_or_default();
        if hashes.is_empty() || self.state.is_none() {
            return self.process_syncing(handle).await;
        }

        if bodies.is_empty() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "empty block bodies response for known hashes",
            )?;
            self.requeue_bodies(hashes);
        } else if bodies.len() > hashes.len() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "more block bodies than requested",
            )?;
            self.requeue_bodies(hashes);
        } else {
            let answered_count = bodies.len();
            let answered = &hashes[..answered_count];
            match self.validator.validate_blocks(answered, &bodies).await {
                BlockValidationResult::Valid => {
                    self.store.store_blocks(answered.to_vec(), bodies).await?;
                    let leftover = hashes[answered_count..].to_vec();
                    if !leftover.is_empty() {
                        trace!(count = leftover.len(), "Re-queueing unanswered body hashes");
                        self.requeue_bodies(leftover);
                    }
                    self.advance_full_blocks(answered).await?;
                }
                BlockValidationResult::Invalid => {
                    self.peer_table.blacklist(
                        &peer_id,
                        self.config.blacklist_duration,
                        "block bodies do not match their headers",
                    )?;
                    self.requeue_bodies(hashes);
                }
                BlockValidationResult::DbError => self.redownload_blockchain(),
            }
        }
        self.process_syncing(handle).await
    }

    async fn on_receipts(
        &mut self,
        peer_id: PeerId,
        receipts: Vec<Vec<Receipt>>,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        self.release_peer(&peer_id);
        let hashes = self.requested_receipts.remove(&peer_id).unwrap_or_default();
        if hashes.is_empty() || self.state.is_none() {
            return self.process_syncing(handle).await;
        }

        if receipts.is_empty() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "empty receipts response for known hashes",
            )?;
            self.requeue_receipts(hashes);
        } else if receipts.len() > hashes.len() {
            self.peer_table.blacklist(
                &peer_id,
                self.config.blacklist_duration,
                "more receipt lists than requested",
            )?;
            self.requeue_receipts(hashes);
        } else {
            let answered_count = receipts.len();
            let answered = &hashes[..answered_count];
            match self.validator.validate_receipts(answered, &receipts).await {
                BlockValidationResult::Valid => {
                    self.store
                        .store_receipts(answered.iter().copied().zip(receipts).collect())
                        .await?;
                    let leftover = hashes[answered_count..].to_vec();
                    if !leftover.is_empty() {
                        trace!(
                            count = leftover.len(),
                            "Re-queueing unanswered receipt hashes"
                        );
                        self.requeue_receipts(leftover);
                    }
                    self.advance_full_blocks(answered).await?;
                }
                BlockValidationResult::Invalid => {
                    self.peer_table.blacklist(
                        &peer_id,
                        self.config.blacklist_duration,
                        "receipts do not match the receipts root",
                    )?;
                    self.requeue_receipts(hashes);
                }
                BlockValidationResult::DbError => self.redownload_blockchain(),
            }
        }
        self.process_syncing(handle).await
    }

    async fn advance_full_blocks(&mut self, hashes: &[BlockHash]) -> Result<(), SyncError> {
        if let Some(new_best) = self.store.update_best_block_if_needed(hashes).await? {
            debug!(new_best, "Fully downloaded blocks advanced");
            if let Some(state) = self.state.as_mut() {
                state.last_full_block_number = new_best;
            }
        }
        Ok(())
    }

    fn requeue_bodies(&mut self, hashes: Vec<BlockHash>) {
        if let Some(state) = self.state.as_mut() {
            for hash in hashes.into_iter().rev() {
                state.block_bodies_queue.push_front(hash);
            }
        }
    }

    fn requeue_receipts(&mut self, hashes: Vec<BlockHash>) {
        if let Some(state) = self.state.as_mut() {
            for hash in hashes.into_iter().rev() {
                state.receipts_queue.push_front(hash);
            }
        }
    }

    /// Storage reported an inconsistency: drop the queues and step the header
    /// cursor back far enough to re-download the suspect region.
    fn redownload_blockchain(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        warn!("Storage error while validating downloads, re-downloading the recent blockchain");
        state.block_bodies_queue.clear();
        state.receipts_queue.clear();
        state.best_block_header_number = state
            .best_block_header_number
            .saturating_sub(2 * self.config.block_headers_per_request);
    }

    async fn on_request_failed(
        &mut self,
        peer_id: PeerId,
        kind: RequestKind,
        reason: RequestFailure,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        debug!(peer_id = %peer_id, ?kind, %reason, "Request failed");
        self.release_peer(&peer_id);
        match kind {
            RequestKind::Headers => {
                if matches!(self.requested_headers, Some((requested, _)) if requested == peer_id) {
                    self.requested_headers = None;
                }
            }
            RequestKind::Bodies => {
                if let Some(hashes) = self.requested_bodies.remove(&peer_id) {
                    self.requeue_bodies(hashes);
                }
            }
            RequestKind::Receipts => {
                if let Some(hashes) = self.requested_receipts.remove(&peer_id) {
                    self.requeue_receipts(hashes);
                }
            }
        }
        self.process_syncing(handle).await
    }

    // --- peer events -------------------------------------------------------

    fn on_peer_handshaked(
        &mut self,
        peer: Peer,
        max_block_number: BlockNumber,
    ) -> Result<(), SyncError> {
        self.peer_table.insert_peer(peer, max_block_number)?;
        Ok(())
    }

    async fn on_peer_disconnected(
        &mut self,
        peer_id: PeerId,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        debug!(peer_id = %peer_id, "Peer disconnected, releasing its work");
        self.peer_table.remove_peer(&peer_id)?;
        self.last_request_at.remove(&peer_id);
        let kind = self
            .assigned
            .get(&peer_id)
            .copied()
            .unwrap_or(RequestKind::Headers);
        self.on_request_failed(peer_id, kind, RequestFailure::ConnectionClosed, handle)
            .await
    }

    // --- pivot update state machine ----------------------------------------

    fn update_pivot_block(&mut self, reason: PivotUpdateReason, handle: &GenServerHandle<Self>) {
        if matches!(self.status, SyncStatus::WaitingForPivotBlockUpdate(_)) {
            return;
        }
        info!(?reason, "Waiting for a new pivot block");
        self.status = SyncStatus::WaitingForPivotBlockUpdate(reason);
        if let Some(state) = self.state.as_mut() {
            state.updating_pivot_block = true;
        }
        self.request_pivot_selection(handle);
    }

    fn request_pivot_selection(&mut self, handle: &GenServerHandle<Self>) {
        if self.pivot_selection_in_flight {
            return;
        }
        self.pivot_selection_in_flight = true;
        spawn_pivot_selection(
            handle.clone(),
            self.peer_table.clone(),
            self.config.clone(),
        );
    }

    async fn on_pivot_selected(
        &mut self,
        header: BlockHeader,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        self.pivot_selection_in_flight = false;
        match self.status {
            SyncStatus::Initialising => {
                info!(
                    number = header.number,
                    hash = %header.hash(),
                    "Selected the initial pivot block"
                );
                self.state = Some(SyncState::new(
                    header,
                    self.config.fast_sync_block_validation_x,
                ));
                self.status = SyncStatus::Syncing;
                self.persist_sync_state().await?;
                self.process_syncing(handle).await
            }
            SyncStatus::WaitingForPivotBlockUpdate(reason) => {
                self.on_pivot_update_result(header, reason, handle).await
            }
            SyncStatus::Syncing => {
                trace!("Ignoring a pivot result outside a pivot update");
                Ok(CastResponse::NoReply)
            }
        }
    }

    async fn on_pivot_update_result(
        &mut self,
        new_header: BlockHeader,
        reason: PivotUpdateReason,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        let Some(current_number) = self.state.as_ref().map(|s| s.pivot_block.number) else {
            return Ok(CastResponse::NoReply);
        };
        if !pivot_good_enough(new_header.number, current_number, reason) {
            debug!(
                offered = new_header.number,
                current = current_number,
                "Selected pivot is not good enough, rescheduling"
            );
            self.count_pivot_failure()?;
            send_after(
                self.config.pivot_block_reschedule_interval,
                handle.clone(),
                InMessage::SelectPivot,
            );
            return Ok(CastResponse::NoReply);
        }

        let validation_x = self.config.fast_sync_block_validation_x;
        match reason {
            PivotUpdateReason::ImportedLastBlock => {
                if new_header.number - current_number <= self.config.max_target_difference {
                    info!("The pivot is close enough to the network tip");
                    self.resume_syncing();
                    self.start_state_sync().await;
                } else {
                    info!(
                        number = new_header.number,
                        "The network tip moved on, adopting a newer pivot"
                    );
                    if let Some(state) = self.state.as_mut() {
                        state.set_pivot(new_header, validation_x);
                    }
                    self.resume_syncing();
                }
            }
            PivotUpdateReason::LastBlockValidationFailed => {
                info!(
                    number = new_header.number,
                    "Adopting a new pivot after a validation failure"
                );
                if let Some(state) = self.state.as_mut() {
                    state.set_pivot(new_header, validation_x);
                }
                self.count_pivot_failure()?;
                self.resume_syncing();
            }
            PivotUpdateReason::SyncRestart => {
                info!(number = new_header.number, "Rebasing onto a newer pivot");
                if let Some(state) = self.state.as_mut() {
                    state.set_pivot(new_header, validation_x);
                }
                self.resume_syncing();
            }
        }
        self.process_syncing(handle).await
    }

    fn resume_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
        if let Some(state) = self.state.as_mut() {
            state.updating_pivot_block = false;
        }
    }

    /// Bumps the failure counter and hard-exits when the budget is spent,
    /// matching the terminal behavior the node operator relies on.
    fn count_pivot_failure(&mut self) -> Result<(), SyncError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        state.pivot_block_update_failures += 1;
        let failures = state.pivot_block_update_failures;
        if failures > self.config.maximum_target_update_failures {
            error!(
                failures,
                "Sync failure, pivot block selection failed too many times"
            );
            std::process::exit(1);
        }
        Ok(())
    }

    async fn on_pivot_selection_failed(
        &mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<CastResponse, SyncError> {
        self.pivot_selection_in_flight = false;
        match self.status {
            SyncStatus::Initialising => {
                warn!("Could not select an initial pivot block, retrying");
                send_after(
                    self.config.pivot_block_reschedule_interval,
                    handle.clone(),
                    InMessage::SelectPivot,
                );
            }
            SyncStatus::WaitingForPivotBlockUpdate(_) => {
                warn!("Pivot block selection failed, retrying");
                self.count_pivot_failure()?;
                send_after(
                    self.config.pivot_block_reschedule_interval,
                    handle.clone(),
                    InMessage::SelectPivot,
                );
            }
            SyncStatus::Syncing => {}
        }
        Ok(CastResponse::NoReply)
    }

    fn on_select_pivot(&mut self, handle: &GenServerHandle<Self>) {
        match self.status {
            SyncStatus::Initialising | SyncStatus::WaitingForPivotBlockUpdate(_) => {
                self.request_pivot_selection(handle);
            }
            SyncStatus::Syncing => {}
        }
    }

    // --- persistence & status ----------------------------------------------

    async fn persist_sync_state(&mut self) -> Result<(), SyncError> {
        let last_full = self.store.last_full_block_number().await?;
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        state.last_full_block_number = last_full;
        let in_flight_bodies: Vec<BlockHash> = self
            .requested_bodies
            .values()
            .flatten()
            .copied()
            .collect();
        let in_flight_receipts: Vec<BlockHash> = self
            .requested_receipts
            .values()
            .flatten()
            .copied()
            .collect();
        let snapshot = state.with_reenqueued_in_flight(in_flight_bodies, in_flight_receipts);
        self.store
            .persist_sync_state_blob(snapshot.encode())
            .await?;
        trace!("Persisted the sync state snapshot");
        Ok(())
    }

    fn print_status(&self) -> Result<(), SyncError> {
        let peers = self.peer_table.peer_count()?;
        let blacklisted = self.peer_table.blacklisted_count()?;
        match &self.state {
            Some(state) => info!(
                "Block: {}/{}. Full blocks: {}. Peers: {} ({} blacklisted). State nodes: {}/{}.",
                state.best_block_header_number,
                state.safe_download_target,
                state.last_full_block_number,
                peers,
                blacklisted,
                state.downloaded_nodes_count,
                state.total_nodes_count,
            ),
            None => info!(
                "Waiting for the initial pivot block. Peers: {} ({} blacklisted).",
                peers, blacklisted
            ),
        }
        Ok(())
    }
}

/// A restart demands strict progress; any other reason accepts the same
/// height again.
fn pivot_good_enough(
    new_number: BlockNumber,
    current_number: BlockNumber,
    reason: PivotUpdateReason,
) -> bool {
    new_number >= current_number
        && !(new_number == current_number && reason == PivotUpdateReason::SyncRestart)
}

impl GenServer for FastSync {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = OutMessage;
    type Error = SyncError;

    async fn init(
        self,
        handle: &GenServerHandle<Self>,
    ) -> Result<spawned_concurrency::tasks::InitResult<Self>, Self::Error> {
        let mut this = self;
        this.scheduler = Some(StateScheduler::spawn(
            this.store.clone(),
            this.peer_table.clone(),
            handle.clone(),
            this.config.clone(),
        ));

        if this.store.is_fast_sync_done().await? {
            this.already_done = true;
        } else if let Some(blob) = this.store.load_sync_state_blob().await? {
            match SyncState::decode(&blob) {
                Ok(mut state) => {
                    info!(
                        best = state.best_block_header_number,
                        target = state.safe_download_target,
                        "Resuming fast sync from the persisted state"
                    );
                    // The update that was interrupted is re-detected from
                    // scratch rather than trusted across a restart
                    state.updating_pivot_block = false;
                    this.store
                        .set_last_full_block_number(state.last_full_block_number)
                        .await?;
                    this.state = Some(state);
                    this.status = SyncStatus::Syncing;
                }
                Err(err) => {
                    warn!(%err, "Could not decode the persisted sync state, starting over");
                    this.request_pivot_selection(handle);
                }
            }
        } else {
            this.request_pivot_selection(handle);
        }

        send_interval(
            this.config.sync_retry_interval,
            handle.clone(),
            InMessage::ProcessSyncing,
        );
        send_interval(
            this.config.print_status_interval,
            handle.clone(),
            InMessage::PrintStatus,
        );
        send_interval(
            this.config.persist_state_snapshot_interval,
            handle.clone(),
            InMessage::PersistSyncState,
        );
        let _ = handle.clone().cast(InMessage::ProcessSyncing).await;
        Ok(Success(this))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        let result = match message {
            InMessage::ProcessSyncing => self.process_syncing(handle).await,
            InMessage::PrintStatus => self.print_status().map(|_| CastResponse::NoReply),
            InMessage::PersistSyncState => self
                .persist_sync_state()
                .await
                .map(|_| CastResponse::NoReply),
            InMessage::SelectPivot => {
                self.on_select_pivot(handle);
                Ok(CastResponse::NoReply)
            }
            InMessage::PeerHandshaked {
                peer,
                max_block_number,
            } => self
                .on_peer_handshaked(peer, max_block_number)
                .map(|_| CastResponse::NoReply),
            InMessage::PeerDisconnected { peer_id } => {
                self.on_peer_disconnected(peer_id, handle).await
            }
            InMessage::BlockHeadersReceived { peer_id, headers } => {
                self.on_block_headers(peer_id, headers, handle).await
            }
            InMessage::BlockBodiesReceived { peer_id, bodies } => {
                self.on_block_bodies(peer_id, bodies, handle).await
            }
            InMessage::ReceiptsReceived { peer_id, receipts } => {
                self.on_receipts(peer_id, receipts, handle).await
            }
            InMessage::RequestFailed {
                peer_id,
                kind,
                reason,
            } => self.on_request_failed(peer_id, kind, reason, handle).await,
            InMessage::PivotSelected { header } => self.on_pivot_selected(header, handle).await,
            InMessage::PivotSelectionFailed => self.on_pivot_selection_failed(handle).await,
            InMessage::StateSyncFinished => {
                info!("State download finished");
                if let Some(state) = self.state.as_mut() {
                    state.state_sync_finished = true;
                }
                self.process_syncing(handle).await
            }
            InMessage::StateSyncStats { saved, missing } => {
                debug!(saved, missing, "State sync progress");
                if let Some(state) = self.state.as_mut() {
                    state.downloaded_nodes_count = saved;
                    state.total_nodes_count = saved + missing;
                }
                Ok(CastResponse::NoReply)
            }
        };
        match result {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "Error while processing a sync event");
                CastResponse::NoReply
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::U256;
    use ember_storage::EngineType;
    use std::net::SocketAddr;

    use crate::connection::PeerConnection;

    fn test_coordinator(config: SyncConfig) -> FastSync {
        let store = Store::new(EngineType::InMemory).unwrap();
        FastSync {
            validator: BlockValidator::new(store.clone()),
            store,
            peer_table: PeerTable::new(),
            config,
            status: SyncStatus::Syncing,
            state: None,
            scheduler: None,
            assigned: HashMap::new(),
            requested_headers: None,
            requested_bodies: HashMap::new(),
            requested_receipts: HashMap::new(),
            last_request_at: HashMap::new(),
            pivot_selection_in_flight: false,
            state_sync_started: false,
            already_done: false,
            completion: None,
        }
    }

    fn pivot_at(number: BlockNumber) -> BlockHeader {
        BlockHeader {
            number,
            difficulty: U256::from(1u64),
            ..Default::default()
        }
    }

    fn add_peer(table: &PeerTable, byte: u8, max_block_number: BlockNumber) {
        let (connection, _rx) = PeerConnection::channel();
        let addr: SocketAddr = "127.0.0.1:30303".parse().unwrap();
        std::mem::forget(_rx);
        table
            .insert_peer(
                Peer {
                    id: PeerId::repeat_byte(byte),
                    addr,
                    connection,
                },
                max_block_number,
            )
            .unwrap();
    }

    #[test]
    fn fully_synced_requires_everything_done() {
        let mut coordinator = test_coordinator(SyncConfig::default());
        let mut state = SyncState::new(pivot_at(950), 50);
        state.best_block_header_number = 1000;
        state.state_sync_finished = true;
        assert!(coordinator.fully_synced(&state));

        // An outstanding handler blocks completion
        coordinator
            .assigned
            .insert(PeerId::repeat_byte(0x01), RequestKind::Bodies);
        assert!(!coordinator.fully_synced(&state));
        coordinator.assigned.clear();

        // Remaining queue entries block completion
        state.enqueue_block(BlockHash::repeat_byte(0x02));
        assert!(!coordinator.fully_synced(&state));
        state.block_bodies_queue.clear();
        state.receipts_queue.clear();

        // Unfinished state sync blocks completion
        state.state_sync_finished = false;
        assert!(!coordinator.fully_synced(&state));
    }

    #[test]
    fn pivot_staleness_needs_a_quorum_of_far_ahead_peers() {
        let mut config = SyncConfig::default();
        config.pivot_block_offset = 50;
        config.max_pivot_block_age = 96;
        config.min_peers_to_choose_pivot_block = 3;
        let mut coordinator = test_coordinator(config);
        coordinator.state = Some(SyncState::new(pivot_at(950), 50));

        // Tip 2000: 2000 - 50 - 950 = 1000 >= 96, far enough
        add_peer(&coordinator.peer_table, 0x01, 2000);
        add_peer(&coordinator.peer_table, 0x02, 2000);
        assert!(!coordinator.pivot_block_is_stale().unwrap());

        // Third far-ahead peer completes the quorum
        add_peer(&coordinator.peer_table, 0x03, 2000);
        assert!(coordinator.pivot_block_is_stale().unwrap());
    }

    #[test]
    fn near_tip_peers_do_not_make_the_pivot_stale() {
        let mut config = SyncConfig::default();
        config.pivot_block_offset = 50;
        config.max_pivot_block_age = 96;
        config.min_peers_to_choose_pivot_block = 2;
        let mut coordinator = test_coordinator(config);
        coordinator.state = Some(SyncState::new(pivot_at(950), 50));

        // 1040 - 50 - 950 = 40 < 96
        add_peer(&coordinator.peer_table, 0x01, 1040);
        add_peer(&coordinator.peer_table, 0x02, 1040);
        assert!(!coordinator.pivot_block_is_stale().unwrap());
    }

    #[test]
    fn pivot_acceptance_follows_the_reason_table() {
        use PivotUpdateReason::*;
        // Progress is always good enough
        assert!(pivot_good_enough(960, 950, ImportedLastBlock));
        assert!(pivot_good_enough(960, 950, SyncRestart));
        assert!(pivot_good_enough(960, 950, LastBlockValidationFailed));
        // Standing still is fine except on a restart
        assert!(pivot_good_enough(950, 950, ImportedLastBlock));
        assert!(pivot_good_enough(950, 950, LastBlockValidationFailed));
        assert!(!pivot_good_enough(950, 950, SyncRestart));
        // Going backwards never is
        assert!(!pivot_good_enough(940, 950, ImportedLastBlock));
        assert!(!pivot_good_enough(940, 950, SyncRestart));
    }

    #[test]
    fn redownload_rewinds_headers_and_clears_queues() {
        let mut config = SyncConfig::default();
        config.block_headers_per_request = 200;
        let mut coordinator = test_coordinator(config);
        let mut state = SyncState::new(pivot_at(950), 50);
        state.best_block_header_number = 500;
        state.enqueue_block(BlockHash::repeat_byte(0x01));
        coordinator.state = Some(state);

        coordinator.redownload_blockchain();

        let state = coordinator.state.as_ref().unwrap();
        assert_eq!(state.best_block_header_number, 100);
        assert!(state.block_bodies_queue.is_empty());
        assert!(state.receipts_queue.is_empty());
    }

    #[test]
    fn redownload_clamps_at_zero() {
        let mut coordinator = test_coordinator(SyncConfig::default());
        let mut state = SyncState::new(pivot_at(950), 50);
        state.best_block_header_number = 100;
        coordinator.state = Some(state);

        coordinator.redownload_blockchain();
        assert_eq!(
            coordinator.state.as_ref().unwrap().best_block_header_number,
            0
        );
    }

    #[test]
    fn requeued_hashes_keep_their_order() {
        let mut coordinator = test_coordinator(SyncConfig::default());
        let mut state = SyncState::new(pivot_at(950), 50);
        state.block_bodies_queue.push_back(BlockHash::repeat_byte(0x03));
        coordinator.state = Some(state);

        coordinator.requeue_bodies(vec![
            BlockHash::repeat_byte(0x01),
            BlockHash::repeat_byte(0x02),
        ]);

        let state = coordinator.state.as_ref().unwrap();
        let queued: Vec<BlockHash> = state.block_bodies_queue.iter().copied().collect();
        assert_eq!(
            queued,
            vec![
                BlockHash::repeat_byte(0x01),
                BlockHash::repeat_byte(0x02),
                BlockHash::repeat_byte(0x03),
            ]
        );
    }
}
