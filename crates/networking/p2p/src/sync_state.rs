use std::collections::VecDeque;

use ember_common::types::{BlockHash, BlockHeader, BlockNumber};
use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};

/// Version tag of the persisted record. Bump when the layout changes.
const SYNC_STATE_VERSION: u8 = 1;

/// The fast-sync control-plane record. Mutated only by the sync coordinator
/// and snapshotted to storage so a crash resumes without re-downloading
/// anything already persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Header whose world state is being materialised.
    pub pivot_block: BlockHeader,
    /// `pivot_block.number + fast_sync_block_validation_x`.
    pub safe_download_target: BlockNumber,
    /// Highest contiguous header accepted.
    pub best_block_header_number: BlockNumber,
    /// Highest block whose body and receipts are stored.
    pub last_full_block_number: BlockNumber,
    /// Hashes of accepted headers awaiting their bodies.
    pub block_bodies_queue: VecDeque<BlockHash>,
    /// Hashes of accepted headers awaiting their receipts.
    pub receipts_queue: VecDeque<BlockHash>,
    /// Rolling cursor of the next header that gets the full validation pass.
    pub next_block_to_fully_validate: BlockNumber,
    pub downloaded_nodes_count: u64,
    pub total_nodes_count: u64,
    pub state_sync_finished: bool,
    pub updating_pivot_block: bool,
    pub pivot_block_update_failures: u32,
}

impl SyncState {
    pub fn new(pivot_block: BlockHeader, validation_x: u64) -> Self {
        let safe_download_target = pivot_block.number + validation_x;
        Self {
            pivot_block,
            safe_download_target,
            best_block_header_number: 0,
            last_full_block_number: 0,
            block_bodies_queue: VecDeque::new(),
            receipts_queue: VecDeque::new(),
            next_block_to_fully_validate: 1,
            downloaded_nodes_count: 0,
            total_nodes_count: 0,
            state_sync_finished: false,
            updating_pivot_block: false,
            pivot_block_update_failures: 0,
        }
    }

    /// Adopts a new pivot and moves the download target with it.
    pub fn set_pivot(&mut self, pivot_block: BlockHeader, validation_x: u64) {
        self.safe_download_target = pivot_block.number + validation_x;
        self.pivot_block = pivot_block;
    }

    /// Queues an accepted header's hash for body and receipt download.
    pub fn enqueue_block(&mut self, hash: BlockHash) {
        self.block_bodies_queue.push_back(hash);
        self.receipts_queue.push_back(hash);
    }

    /// Snapshot for persistence: hashes currently assigned to request
    /// handlers go back on the front of their queues, so a restart simply
    /// re-requests them.
    pub fn with_reenqueued_in_flight(
        &self,
        in_flight_bodies: Vec<BlockHash>,
        in_flight_receipts: Vec<BlockHash>,
    ) -> SyncState {
        let mut snapshot = self.clone();
        for hash in in_flight_bodies.into_iter().rev() {
            snapshot.block_bodies_queue.push_front(hash);
        }
        for hash in in_flight_receipts.into_iter().rev() {
            snapshot.receipts_queue.push_front(hash);
        }
        snapshot
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut blob = vec![SYNC_STATE_VERSION];
        Encoder::new(&mut blob)
            .encode_field(&self.pivot_block)
            .encode_field(&self.safe_download_target)
            .encode_field(&self.best_block_header_number)
            .encode_field(&self.last_full_block_number)
            .encode_field(&Vec::from(self.block_bodies_queue.clone()))
            .encode_field(&Vec::from(self.receipts_queue.clone()))
            .encode_field(&self.next_block_to_fully_validate)
            .encode_field(&self.downloaded_nodes_count)
            .encode_field(&self.total_nodes_count)
            .encode_field(&self.state_sync_finished)
            .encode_field(&self.updating_pivot_block)
            .encode_field(&self.pivot_block_update_failures)
            .finish();
        blob
    }

    pub fn decode(blob: &[u8]) -> Result<Self, RLPDecodeError> {
        let (version, rest) = blob.split_first().ok_or(RLPDecodeError::UnexpectedEof)?;
        if *version != SYNC_STATE_VERSION {
            return Err(RLPDecodeError::UnsupportedVersion(*version));
        }
        let decoder = Decoder::new(rest)?;
        let (pivot_block, decoder) = decoder.decode_field("pivot_block")?;
        let (safe_download_target, decoder) = decoder.decode_field("safe_download_target")?;
        let (best_block_header_number, decoder) =
            decoder.decode_field("best_block_header_number")?;
        let (last_full_block_number, decoder) = decoder.decode_field("last_full_block_number")?;
        let (block_bodies_queue, decoder): (Vec<BlockHash>, _) =
            decoder.decode_field("block_bodies_queue")?;
        let (receipts_queue, decoder): (Vec<BlockHash>, _) =
            decoder.decode_field("receipts_queue")?;
        let (next_block_to_fully_validate, decoder) =
            decoder.decode_field("next_block_to_fully_validate")?;
        let (downloaded_nodes_count, decoder) = decoder.decode_field("downloaded_nodes_count")?;
        let (total_nodes_count, decoder) = decoder.decode_field("total_nodes_count")?;
        let (state_sync_finished, decoder) = decoder.decode_field("state_sync_finished")?;
        let (updating_pivot_block, decoder) = decoder.decode_field("updating_pivot_block")?;
        let (pivot_block_update_failures, decoder) =
            decoder.decode_field("pivot_block_update_failures")?;
        decoder.finish()?;
        Ok(SyncState {
            pivot_block,
            safe_download_target,
            best_block_header_number,
            last_full_block_number,
            block_bodies_queue: block_bodies_queue.into(),
            receipts_queue: receipts_queue.into(),
            next_block_to_fully_validate,
            downloaded_nodes_count,
            total_nodes_count,
            state_sync_finished,
            updating_pivot_block,
            pivot_block_update_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::U256;

    fn sample_state() -> SyncState {
        let pivot = BlockHeader {
            number: 950,
            difficulty: U256::from(17u64),
            ..Default::default()
        };
        let mut state = SyncState::new(pivot, 50);
        state.best_block_header_number = 500;
        state.last_full_block_number = 300;
        state.next_block_to_fully_validate = 512;
        state.enqueue_block(BlockHash::repeat_byte(0x01));
        state.enqueue_block(BlockHash::repeat_byte(0x02));
        state.downloaded_nodes_count = 1234;
        state.total_nodes_count = 9999;
        state
    }

    #[test]
    fn persisting_and_reloading_is_byte_equal() {
        let state = sample_state();
        let blob = state.encode();
        let reloaded = SyncState::decode(&blob).unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.encode(), blob);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut blob = sample_state().encode();
        blob[0] = 99;
        assert_eq!(
            SyncState::decode(&blob),
            Err(RLPDecodeError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn target_follows_the_pivot() {
        let mut state = sample_state();
        assert_eq!(state.safe_download_target, 1000);
        state.set_pivot(
            BlockHeader {
                number: 1950,
                ..Default::default()
            },
            50,
        );
        assert_eq!(state.safe_download_target, 2000);
    }

    #[test]
    fn in_flight_work_is_reenqueued_in_order() {
        let state = sample_state();
        let snapshot = state.with_reenqueued_in_flight(
            vec![BlockHash::repeat_byte(0xaa), BlockHash::repeat_byte(0xbb)],
            vec![],
        );
        assert_eq!(
            snapshot.block_bodies_queue[0],
            BlockHash::repeat_byte(0xaa)
        );
        assert_eq!(
            snapshot.block_bodies_queue[1],
            BlockHash::repeat_byte(0xbb)
        );
        assert_eq!(
            snapshot.block_bodies_queue[2],
            BlockHash::repeat_byte(0x01)
        );
        // Receipts queue untouched
        assert_eq!(snapshot.receipts_queue, state.receipts_queue);
    }
}
