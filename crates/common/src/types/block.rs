use bytes::{BufMut, Bytes};
use ethereum_types::{Address, Bloom, H256, U256};
use thiserror::Error;

use ember_rlp::decode::RLPDecode;
use ember_rlp::encode::RLPEncode;
use ember_rlp::error::RLPDecodeError;
use ember_rlp::structs::{Decoder, Encoder};
use ember_trie::compute_ordered_root;

use crate::types::transaction::Transaction;
use crate::utils::keccak;

pub type BlockNumber = u64;
pub type BlockHash = H256;

/// A proof-of-work chain block header. Content-addressed by the keccak hash
/// of its RLP encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub ommers_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: H256,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        keccak(self.encode_to_vec())
    }
}

impl RLPEncode for BlockHeader {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.parent_hash)
            .encode_field(&self.ommers_hash)
            .encode_field(&self.coinbase)
            .encode_field(&self.state_root)
            .encode_field(&self.transactions_root)
            .encode_field(&self.receipts_root)
            .encode_field(&self.logs_bloom)
            .encode_field(&self.difficulty)
            .encode_field(&self.number)
            .encode_field(&self.gas_limit)
            .encode_field(&self.gas_used)
            .encode_field(&self.timestamp)
            .encode_field(&self.extra_data)
            .encode_field(&self.mix_hash)
            .encode_field(&self.nonce.to_be_bytes())
            .finish();
    }
}

impl RLPDecode for BlockHeader {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (parent_hash, decoder) = decoder.decode_field("parent_hash")?;
        let (ommers_hash, decoder) = decoder.decode_field("ommers_hash")?;
        let (coinbase, decoder) = decoder.decode_field("coinbase")?;
        let (state_root, decoder) = decoder.decode_field("state_root")?;
        let (transactions_root, decoder) = decoder.decode_field("transactions_root")?;
        let (receipts_root, decoder) = decoder.decode_field("receipts_root")?;
        let (logs_bloom, decoder) = decoder.decode_field("logs_bloom")?;
        let (difficulty, decoder) = decoder.decode_field("difficulty")?;
        let (number, decoder) = decoder.decode_field("number")?;
        let (gas_limit, decoder) = decoder.decode_field("gas_limit")?;
        let (gas_used, decoder) = decoder.decode_field("gas_used")?;
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        let (extra_data, decoder) = decoder.decode_field("extra_data")?;
        let (mix_hash, decoder) = decoder.decode_field("mix_hash")?;
        let (nonce_bytes, decoder): (Bytes, _) = decoder.decode_field("nonce")?;
        let remaining = decoder.finish()?;
        if nonce_bytes.len() != 8 {
            return Err(RLPDecodeError::InvalidField("nonce".to_string()));
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&nonce_bytes);
        let header = BlockHeader {
            parent_hash,
            ommers_hash,
            coinbase,
            state_root,
            transactions_root,
            receipts_root,
            logs_bloom,
            difficulty,
            number,
            gas_limit,
            gas_used,
            timestamp,
            extra_data,
            mix_hash,
            nonce: u64::from_be_bytes(nonce),
        };
        Ok((header, remaining))
    }
}

/// Transactions and ommer headers of one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub ommers: Vec<BlockHeader>,
}

impl RLPEncode for BlockBody {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.transactions)
            .encode_field(&self.ommers)
            .finish();
    }
}

impl RLPDecode for BlockBody {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (transactions, decoder) = decoder.decode_field("transactions")?;
        let (ommers, decoder) = decoder.decode_field("ommers")?;
        let remaining = decoder.finish()?;
        Ok((
            BlockBody {
                transactions,
                ommers,
            },
            remaining,
        ))
    }
}

pub fn compute_transactions_root(transactions: &[Transaction]) -> H256 {
    let encoded: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.encode_to_vec()).collect();
    compute_ordered_root(&encoded)
}

pub fn compute_ommers_hash(ommers: &[BlockHeader]) -> H256 {
    keccak(ommers.to_vec().encode_to_vec())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBlockBodyError {
    #[error(
        "Transactions root mismatch for block {block_hash}: header says {expected}, body gives {actual}"
    )]
    TransactionsRootMismatch {
        block_hash: BlockHash,
        expected: H256,
        actual: H256,
    },
    #[error(
        "Ommers hash mismatch for block {block_hash}: header says {expected}, body gives {actual}"
    )]
    OmmersHashMismatch {
        block_hash: BlockHash,
        expected: H256,
        actual: H256,
    },
}

/// Checks that a body belongs to the given header: the transactions must
/// hash to the header's transactions root and the ommer list to its ommers
/// hash.
pub fn validate_block_body(
    header: &BlockHeader,
    body: &BlockBody,
) -> Result<(), InvalidBlockBodyError> {
    let transactions_root = compute_transactions_root(&body.transactions);
    if transactions_root != header.transactions_root {
        return Err(InvalidBlockBodyError::TransactionsRootMismatch {
            block_hash: header.hash(),
            expected: header.transactions_root,
            actual: transactions_root,
        });
    }
    let ommers_hash = compute_ommers_hash(&body.ommers);
    if ommers_hash != header.ommers_hash {
        return Err(InvalidBlockBodyError::OmmersHashMismatch {
            block_hash: header.hash(),
            expected: header.ommers_hash,
            actual: ommers_hash,
        });
    }
    Ok(())
}
