mod account;
mod block;
mod chain_weight;
mod receipt;
mod transaction;

pub use account::{AccountState, EMPTY_CODE_HASH};
pub use block::{
    BlockBody, BlockHash, BlockHeader, BlockNumber, InvalidBlockBodyError, compute_ommers_hash,
    compute_transactions_root, validate_block_body,
};
pub use chain_weight::ChainWeight;
pub use receipt::{Log, Receipt, compute_receipts_root};
pub use transaction::{Transaction, TxKind};
