use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use ember_common::H256;
use ember_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber, ChainWeight, Receipt};

use crate::api::StoreEngine;
use crate::error::StoreError;
use crate::store_db::in_memory::Store as InMemoryStore;

/// Blockchain storage façade used by the fast-sync engine. All writes for
/// blockchain data are funnelled through the sync coordinator; state-trie
/// nodes are written by the state scheduler under a disjoint key space.
#[derive(Debug, Clone)]
pub struct Store {
    engine: Arc<dyn StoreEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
}

impl Store {
    pub fn new(engine_type: EngineType) -> Result<Self, StoreError> {
        info!("Starting storage engine ({engine_type:?})");
        let store = match engine_type {
            EngineType::InMemory => Self {
                engine: Arc::new(InMemoryStore::new()),
            },
        };
        Ok(store)
    }

    /// Seeds the genesis block. Fast sync starts downloading at block 1 and
    /// derives every chain weight from its parent's, so the genesis weight
    /// must exist before the first header batch is processed.
    pub async fn init_genesis(&self, genesis: BlockHeader) -> Result<(), StoreError> {
        let weight = ChainWeight::zero().increase(&genesis);
        self.engine.put_header_with_weight(genesis, weight).await
    }

    pub async fn get_block_header(
        &self,
        hash: BlockHash,
    ) -> Result<Option<BlockHeader>, StoreError> {
        self.engine.get_block_header(hash).await
    }

    pub async fn get_block_header_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeader>, StoreError> {
        match self.engine.get_canonical_hash(number).await? {
            Some(hash) => self.engine.get_block_header(hash).await,
            None => Ok(None),
        }
    }

    pub async fn get_canonical_hash(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHash>, StoreError> {
        self.engine.get_canonical_hash(number).await
    }

    pub async fn get_block_body(&self, hash: BlockHash) -> Result<Option<BlockBody>, StoreError> {
        self.engine.get_block_body(hash).await
    }

    pub async fn get_receipts(&self, hash: BlockHash) -> Result<Option<Vec<Receipt>>, StoreError> {
        self.engine.get_receipts(hash).await
    }

    /// Stores downloaded block bodies keyed by their block hashes.
    pub async fn store_blocks(
        &self,
        hashes: Vec<BlockHash>,
        bodies: Vec<BlockBody>,
    ) -> Result<(), StoreError> {
        self.engine
            .put_block_bodies(hashes.into_iter().zip(bodies).collect())
            .await
    }

    pub async fn store_receipts(
        &self,
        receipts: Vec<(BlockHash, Vec<Receipt>)>,
    ) -> Result<(), StoreError> {
        self.engine.put_receipts(receipts).await
    }

    pub async fn get_parent_chain_weight(
        &self,
        header: &BlockHeader,
    ) -> Result<Option<ChainWeight>, StoreError> {
        self.engine.get_chain_weight(header.parent_hash).await
    }

    /// Persists an accepted header together with its derived chain weight.
    pub async fn persist_header(
        &self,
        header: BlockHeader,
        parent_weight: ChainWeight,
    ) -> Result<(), StoreError> {
        let weight = parent_weight.increase(&header);
        self.engine.put_header_with_weight(header, weight).await
    }

    pub async fn last_full_block_number(&self) -> Result<BlockNumber, StoreError> {
        self.engine.get_last_full_block_number().await
    }

    /// Restores the fully-downloaded cursor from a reloaded sync state.
    pub async fn set_last_full_block_number(&self, number: BlockNumber) -> Result<(), StoreError> {
        self.engine.set_last_full_block_number(number).await
    }

    /// Advances the fully-downloaded cursor over the longest contiguous
    /// prefix of blocks whose body and receipts are both stored. `hashes`
    /// are the blocks that just completed; when none of them is the next
    /// block in line the cursor cannot move and the walk is skipped.
    pub async fn update_best_block_if_needed(
        &self,
        hashes: &[BlockHash],
    ) -> Result<Option<BlockNumber>, StoreError> {
        let start = self.engine.get_last_full_block_number().await?;
        let mut can_advance = false;
        for hash in hashes {
            if let Some(header) = self.engine.get_block_header(*hash).await? {
                if header.number == start + 1 {
                    can_advance = true;
                    break;
                }
            }
        }
        if !can_advance {
            return Ok(None);
        }
        let mut best = start;
        loop {
            let Some(hash) = self.engine.get_canonical_hash(best + 1).await? else {
                break;
            };
            if self.engine.get_block_body(hash).await?.is_none() {
                break;
            }
            if self.engine.get_receipts(hash).await?.is_none() {
                break;
            }
            best += 1;
        }
        if best > start {
            self.engine.set_last_full_block_number(best).await?;
            Ok(Some(best))
        } else {
            Ok(None)
        }
    }

    /// Atomically drops all block data for numbers `from-n+1 ..= from`.
    pub async fn discard_last_blocks(&self, from: BlockNumber, n: u64) -> Result<(), StoreError> {
        if n == 0 {
            return Ok(());
        }
        let first = from.saturating_sub(n - 1).max(1);
        self.engine.remove_block_range(first, from).await
    }

    pub async fn put_state_node(&self, hash: H256, node: Bytes) -> Result<(), StoreError> {
        self.engine.put_state_node(hash, node).await
    }

    pub async fn get_state_node(&self, hash: H256) -> Result<Option<Bytes>, StoreError> {
        self.engine.get_state_node(hash).await
    }

    pub async fn contains_state_node(&self, hash: H256) -> Result<bool, StoreError> {
        self.engine.contains_state_node(hash).await
    }

    /// Writes the serialized sync-state record. Presence of this record on
    /// startup means fast sync is in progress.
    pub async fn persist_sync_state_blob(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.engine.put_sync_state(blob).await
    }

    pub async fn load_sync_state_blob(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.engine.get_sync_state().await
    }

    /// Removes the sync-state record and marks fast sync as completed.
    pub async fn persist_fast_sync_done(&self) -> Result<(), StoreError> {
        self.engine.set_fast_sync_done().await
    }

    pub async fn is_fast_sync_done(&self) -> Result<bool, StoreError> {
        self.engine.is_fast_sync_done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::U256;

    fn header_chain(len: u64) -> Vec<BlockHeader> {
        let mut headers = vec![BlockHeader {
            number: 0,
            difficulty: U256::from(1u64),
            ..Default::default()
        }];
        for number in 1..=len {
            let parent_hash = headers.last().unwrap().hash();
            headers.push(BlockHeader {
                number,
                parent_hash,
                difficulty: U256::from(1u64),
                ..Default::default()
            });
        }
        headers
    }

    async fn seeded_store(headers: &[BlockHeader]) -> Store {
        let store = Store::new(EngineType::InMemory).unwrap();
        store.init_genesis(headers[0].clone()).await.unwrap();
        for header in &headers[1..] {
            let parent_weight = store
                .get_parent_chain_weight(header)
                .await
                .unwrap()
                .unwrap();
            store
                .persist_header(header.clone(), parent_weight)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn chain_weights_accumulate_from_genesis() {
        let headers = header_chain(3);
        let store = seeded_store(&headers).await;
        let weight = store
            .get_parent_chain_weight(&headers[3])
            .await
            .unwrap()
            .unwrap();
        // Genesis contributes difficulty 1, plus blocks 1 and 2
        assert_eq!(weight.total_difficulty, U256::from(3u64));
    }

    #[tokio::test]
    async fn best_block_advances_over_contiguous_prefix_only() {
        let headers = header_chain(4);
        let store = seeded_store(&headers).await;
        let hashes: Vec<BlockHash> = headers.iter().map(|h| h.hash()).collect();

        // Store bodies and receipts for blocks 1, 2, and 4 (3 is missing)
        for number in [1usize, 2, 4] {
            store
                .store_blocks(vec![hashes[number]], vec![BlockBody::default()])
                .await
                .unwrap();
            store
                .store_receipts(vec![(hashes[number], vec![])])
                .await
                .unwrap();
        }

        let new_best = store
            .update_best_block_if_needed(&[hashes[1], hashes[2], hashes[4]])
            .await
            .unwrap();
        assert_eq!(new_best, Some(2));
        assert_eq!(store.last_full_block_number().await.unwrap(), 2);

        // Completing block 3 unblocks the rest of the prefix
        store
            .store_blocks(vec![hashes[3]], vec![BlockBody::default()])
            .await
            .unwrap();
        store
            .store_receipts(vec![(hashes[3], vec![])])
            .await
            .unwrap();
        let new_best = store
            .update_best_block_if_needed(&[hashes[3]])
            .await
            .unwrap();
        assert_eq!(new_best, Some(4));
    }

    #[tokio::test]
    async fn best_block_walk_skipped_when_nothing_contiguous() {
        let headers = header_chain(3);
        let store = seeded_store(&headers).await;
        let hash = headers[3].hash();
        store
            .store_blocks(vec![hash], vec![BlockBody::default()])
            .await
            .unwrap();
        store.store_receipts(vec![(hash, vec![])]).await.unwrap();
        assert_eq!(store.update_best_block_if_needed(&[hash]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn discard_last_blocks_drops_the_requested_range() {
        let headers = header_chain(5);
        let store = seeded_store(&headers).await;

        store.discard_last_blocks(5, 2).await.unwrap();

        assert!(
            store
                .get_block_header_by_number(5)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get_block_header_by_number(4)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get_block_header_by_number(3)
                .await
                .unwrap()
                .is_some()
        );
        // The discarded headers' weights are gone too
        assert_eq!(
            store
                .get_parent_chain_weight(&headers[5])
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn sync_state_record_lifecycle() {
        let store = Store::new(EngineType::InMemory).unwrap();
        assert_eq!(store.load_sync_state_blob().await.unwrap(), None);
        assert!(!store.is_fast_sync_done().await.unwrap());

        store
            .persist_sync_state_blob(vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(
            store.load_sync_state_blob().await.unwrap(),
            Some(vec![1, 2, 3])
        );

        store.persist_fast_sync_done().await.unwrap();
        assert_eq!(store.load_sync_state_blob().await.unwrap(), None);
        assert!(store.is_fast_sync_done().await.unwrap());
    }
}
