use std::fmt::Debug;

use bytes::Bytes;
use ember_common::H256;
use ember_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber, ChainWeight, Receipt};

use crate::error::StoreError;

// async_trait because the stabilized feature lacks support for object safety
// (i.e. dyn StoreEngine)
#[async_trait::async_trait]
pub trait StoreEngine: Debug + Send + Sync {
    async fn get_block_header(&self, hash: BlockHash) -> Result<Option<BlockHeader>, StoreError>;

    async fn get_canonical_hash(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHash>, StoreError>;

    /// Stores a header together with its chain weight and the number index,
    /// as one atomic batch.
    async fn put_header_with_weight(
        &self,
        header: BlockHeader,
        weight: ChainWeight,
    ) -> Result<(), StoreError>;

    async fn get_chain_weight(&self, hash: BlockHash) -> Result<Option<ChainWeight>, StoreError>;

    async fn put_block_bodies(
        &self,
        bodies: Vec<(BlockHash, BlockBody)>,
    ) -> Result<(), StoreError>;

    async fn get_block_body(&self, hash: BlockHash) -> Result<Option<BlockBody>, StoreError>;

    async fn put_receipts(
        &self,
        receipts: Vec<(BlockHash, Vec<Receipt>)>,
    ) -> Result<(), StoreError>;

    async fn get_receipts(&self, hash: BlockHash) -> Result<Option<Vec<Receipt>>, StoreError>;

    /// Atomically removes headers, bodies, receipts, chain weights, and the
    /// number index for block numbers `first..=last`.
    async fn remove_block_range(
        &self,
        first: BlockNumber,
        last: BlockNumber,
    ) -> Result<(), StoreError>;

    async fn get_last_full_block_number(&self) -> Result<BlockNumber, StoreError>;

    async fn set_last_full_block_number(&self, number: BlockNumber) -> Result<(), StoreError>;

    async fn put_state_node(&self, hash: H256, node: Bytes) -> Result<(), StoreError>;

    async fn get_state_node(&self, hash: H256) -> Result<Option<Bytes>, StoreError>;

    async fn contains_state_node(&self, hash: H256) -> Result<bool, StoreError>;

    async fn put_sync_state(&self, blob: Vec<u8>) -> Result<(), StoreError>;

    async fn get_sync_state(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Removes the sync-state record and writes the fast-sync-done marker,
    /// atomically.
    async fn set_fast_sync_done(&self) -> Result<(), StoreError>;

    async fn is_fast_sync_done(&self) -> Result<bool, StoreError>;
}
