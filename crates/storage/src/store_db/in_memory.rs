use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use ember_common::H256;
use ember_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber, ChainWeight, Receipt};

use crate::api::StoreEngine;
use crate::error::StoreError;

#[derive(Default, Clone, Debug)]
pub struct Store(Arc<Mutex<StoreInner>>);

#[derive(Default, Debug)]
struct StoreInner {
    /// Map of headers by block hash
    headers: HashMap<BlockHash, BlockHeader>,
    /// Map of block hashes by block number
    canonical_hashes: HashMap<BlockNumber, BlockHash>,
    /// Map of bodies by block hash
    bodies: HashMap<BlockHash, BlockBody>,
    /// Map of receipt lists by block hash
    receipts: HashMap<BlockHash, Vec<Receipt>>,
    /// Map of chain weights by block hash
    chain_weights: HashMap<BlockHash, ChainWeight>,
    /// Highest block with both body and receipts stored
    last_full_block_number: BlockNumber,
    /// State-trie nodes and contract code by hash
    state_nodes: HashMap<H256, Bytes>,
    /// Serialized fast-sync control record
    sync_state: Option<Vec<u8>>,
    /// Set once fast sync has completed
    fast_sync_done: bool,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, StoreInner>, StoreError> {
        self.0.lock().map_err(|_| StoreError::LockError)
    }
}

#[async_trait::async_trait]
impl StoreEngine for Store {
    async fn get_block_header(&self, hash: BlockHash) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.inner()?.headers.get(&hash).cloned())
    }

    async fn get_canonical_hash(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.inner()?.canonical_hashes.get(&number).copied())
    }

    async fn put_header_with_weight(
        &self,
        header: BlockHeader,
        weight: ChainWeight,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        let hash = header.hash();
        inner.canonical_hashes.insert(header.number, hash);
        inner.chain_weights.insert(hash, weight);
        inner.headers.insert(hash, header);
        Ok(())
    }

    async fn get_chain_weight(&self, hash: BlockHash) -> Result<Option<ChainWeight>, StoreError> {
        Ok(self.inner()?.chain_weights.get(&hash).copied())
    }

    async fn put_block_bodies(
        &self,
        bodies: Vec<(BlockHash, BlockBody)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        for (hash, body) in bodies {
            inner.bodies.insert(hash, body);
        }
        Ok(())
    }

    async fn get_block_body(&self, hash: BlockHash) -> Result<Option<BlockBody>, StoreError> {
        Ok(self.inner()?.bodies.get(&hash).cloned())
    }

    async fn put_receipts(
        &self,
        receipts: Vec<(BlockHash, Vec<Receipt>)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        for (hash, block_receipts) in receipts {
            inner.receipts.insert(hash, block_receipts);
        }
        Ok(())
    }

    async fn get_receipts(&self, hash: BlockHash) -> Result<Option<Vec<Receipt>>, StoreError> {
        Ok(self.inner()?.receipts.get(&hash).cloned())
    }

    async fn remove_block_range(
        &self,
        first: BlockNumber,
        last: BlockNumber,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        for number in first..=last {
            if let Some(hash) = inner.canonical_hashes.remove(&number) {
                inner.headers.remove(&hash);
                inner.bodies.remove(&hash);
                inner.receipts.remove(&hash);
                inner.chain_weights.remove(&hash);
            }
        }
        if inner.last_full_block_number >= first {
            inner.last_full_block_number = first.saturating_sub(1);
        }
        Ok(())
    }

    async fn get_last_full_block_number(&self) -> Result<BlockNumber, StoreError> {
        Ok(self.inner()?.last_full_block_number)
    }

    async fn set_last_full_block_number(&self, number: BlockNumber) -> Result<(), StoreError> {
        self.inner()?.last_full_block_number = number;
        Ok(())
    }

    async fn put_state_node(&self, hash: H256, node: Bytes) -> Result<(), StoreError> {
        self.inner()?.state_nodes.insert(hash, node);
        Ok(())
    }

    async fn get_state_node(&self, hash: H256) -> Result<Option<Bytes>, StoreError> {
        Ok(self.inner()?.state_nodes.get(&hash).cloned())
    }

    async fn contains_state_node(&self, hash: H256) -> Result<bool, StoreError> {
        Ok(self.inner()?.state_nodes.contains_key(&hash))
    }

    async fn put_sync_state(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.inner()?.sync_state = Some(blob);
        Ok(())
    }

    async fn get_sync_state(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner()?.sync_state.clone())
    }

    async fn set_fast_sync_done(&self) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        inner.sync_state = None;
        inner.fast_sync_done = true;
        Ok(())
    }

    async fn is_fast_sync_done(&self) -> Result<bool, StoreError> {
        Ok(self.inner()?.fast_sync_done)
    }
}
