use thiserror::Error;

use ember_common::types::{
    BlockBody, BlockHash, BlockHeader, Receipt, compute_receipts_root, validate_block_body,
};
use ember_storage::Store;

/// Maximum extra-data payload a header may carry.
const MAX_EXTRA_DATA_SIZE: usize = 32;
/// Divisor bounding how fast the gas limit may move between blocks.
const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
const MIN_GAS_LIMIT: u64 = 5000;

/// Checks that headers form a contiguous chain segment: each parent hash
/// matches the predecessor's hash and numbers are strictly consecutive.
pub fn headers_chained(headers: &[BlockHeader]) -> bool {
    headers.windows(2).all(|pair| {
        pair[1].parent_hash == pair[0].hash() && pair[1].number == pair[0].number + 1
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderValidationError {
    #[error("Block number is not the parent's plus one")]
    NonConsecutiveNumber,
    #[error("Parent hash does not match the parent header")]
    ParentHashMismatch,
    #[error("Timestamp is not newer than the parent's")]
    StaleTimestamp,
    #[error("Gas used exceeds the gas limit")]
    GasUsedOverLimit,
    #[error("Gas limit moved too far from the parent's")]
    GasLimitOutOfBounds,
    #[error("Extra data is longer than {MAX_EXTRA_DATA_SIZE} bytes")]
    ExtraDataTooLong,
    #[error("Difficulty is zero")]
    ZeroDifficulty,
}

/// Outcome of validating a batch of bodies or receipts against stored
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidationResult {
    Valid,
    Invalid,
    DbError,
}

/// Stateless block validation. Header checks are structural plus the
/// config-independent consensus rules; the proof-of-work seal itself is
/// verified by the consensus engine behind the chain configuration, which
/// fast sync treats as an external collaborator.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    store: Store,
}

impl BlockValidator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn validate_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), HeaderValidationError> {
        if header.number != parent.number + 1 {
            return Err(HeaderValidationError::NonConsecutiveNumber);
        }
        if header.parent_hash != parent.hash() {
            return Err(HeaderValidationError::ParentHashMismatch);
        }
        if header.timestamp <= parent.timestamp {
            return Err(HeaderValidationError::StaleTimestamp);
        }
        if header.gas_used > header.gas_limit {
            return Err(HeaderValidationError::GasUsedOverLimit);
        }
        let bound = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        if header.gas_limit < MIN_GAS_LIMIT
            || header.gas_limit >= parent.gas_limit + bound
            || header.gas_limit <= parent.gas_limit.saturating_sub(bound)
        {
            return Err(HeaderValidationError::GasLimitOutOfBounds);
        }
        if header.extra_data.len() > MAX_EXTRA_DATA_SIZE {
            return Err(HeaderValidationError::ExtraDataTooLong);
        }
        if header.difficulty.is_zero() {
            return Err(HeaderValidationError::ZeroDifficulty);
        }
        Ok(())
    }

    /// Checks each body against its stored header: transactions root and
    /// ommers hash.
    pub async fn validate_blocks(
        &self,
        hashes: &[BlockHash],
        bodies: &[BlockBody],
    ) -> BlockValidationResult {
        for (hash, body) in hashes.iter().zip(bodies) {
            let header = match self.store.get_block_header(*hash).await {
                Ok(Some(header)) => header,
                Ok(None) | Err(_) => return BlockValidationResult::DbError,
            };
            if validate_block_body(&header, body).is_err() {
                return BlockValidationResult::Invalid;
            }
        }
        BlockValidationResult::Valid
    }

    /// Checks each receipt list against its stored header's receipts root.
    pub async fn validate_receipts(
        &self,
        hashes: &[BlockHash],
        receipt_lists: &[Vec<Receipt>],
    ) -> BlockValidationResult {
        for (hash, receipts) in hashes.iter().zip(receipt_lists) {
            let header = match self.store.get_block_header(*hash).await {
                Ok(Some(header)) => header,
                Ok(None) | Err(_) => return BlockValidationResult::DbError,
            };
            if compute_receipts_root(receipts) != header.receipts_root {
                return BlockValidationResult::Invalid;
            }
        }
        BlockValidationResult::Valid
    }
}
