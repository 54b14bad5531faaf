use std::collections::HashMap;

use spawned_concurrency::tasks::GenServerHandle;
use tokio::task::JoinSet;
use tracing::debug;

use ember_common::H256;
use ember_common::types::BlockHeader;

use crate::config::SyncConfig;
use crate::messages::{GetBlockHeaders, HashOrNumber, Message};
use crate::peer_table::PeerTable;
use crate::sync::{FastSync, InMessage};

/// Selection rounds attempted before the failure is reported back to the
/// coordinator, which owns rescheduling and the failure budget.
const PIVOT_SELECTION_ROUNDS: u32 = 3;

/// Queries a quorum of peers for the header at `best tip - pivot offset` and
/// casts `PivotSelected` once enough of them agree on one header, or
/// `PivotSelectionFailed` after the rounds are exhausted.
pub(crate) fn spawn_pivot_selection(
    handle: GenServerHandle<FastSync>,
    peer_table: PeerTable,
    config: SyncConfig,
) {
    tokio::spawn(async move {
        let mut handle = handle;
        for round in 0..PIVOT_SELECTION_ROUNDS {
            if round > 0 {
                tokio::time::sleep(config.pivot_block_reschedule_interval).await;
            }
            if let Some(header) = select_pivot_once(&peer_table, &config).await {
                debug!(number = header.number, "Peers agreed on a pivot block");
                let _ = handle.cast(InMessage::PivotSelected { header }).await;
                return;
            }
            debug!(round, "Pivot selection round failed");
        }
        let _ = handle.cast(InMessage::PivotSelectionFailed).await;
    });
}

async fn select_pivot_once(peer_table: &PeerTable, config: &SyncConfig) -> Option<BlockHeader> {
    let peers = peer_table.peers_to_download_from().ok()?;
    if peers.len() < config.min_peers_to_choose_pivot_block {
        debug!(
            available = peers.len(),
            required = config.min_peers_to_choose_pivot_block,
            "Not enough peers to choose a pivot block"
        );
        return None;
    }
    let best_tip = peers.iter().map(|(_, info)| info.max_block_number).max()?;
    if best_tip <= config.pivot_block_offset {
        debug!(best_tip, "Advertised chain is too short for fast sync");
        return None;
    }
    let target = best_tip - config.pivot_block_offset;

    let mut requests = JoinSet::new();
    let timeout = config.peer_response_timeout;
    for (peer, _info) in peers {
        requests.spawn(async move {
            let mut connection = peer.connection;
            let request = Message::GetBlockHeaders(GetBlockHeaders {
                id: rand::random(),
                startblock: HashOrNumber::Number(target),
                limit: 1,
                skip: 0,
                reverse: false,
            });
            match connection.outgoing_request(request, timeout).await {
                Ok(Message::BlockHeaders(response)) => response
                    .block_headers
                    .into_iter()
                    .find(|header| header.number == target),
                _ => None,
            }
        });
    }

    let mut votes: HashMap<H256, (BlockHeader, usize)> = HashMap::new();
    while let Some(result) = requests.join_next().await {
        if let Ok(Some(header)) = result {
            votes.entry(header.hash()).or_insert((header, 0)).1 += 1;
        }
    }

    let (header, count) = votes.into_values().max_by_key(|(_, count)| *count)?;
    if count >= config.min_peers_to_choose_pivot_block {
        Some(header)
    } else {
        debug!(
            agreeing = count,
            required = config.min_peers_to_choose_pivot_block,
            "No header reached the pivot quorum"
        );
        None
    }
}
