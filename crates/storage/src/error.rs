use thiserror::Error;

use ember_rlp::error::RLPDecodeError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to lock the store")]
    LockError,
    #[error("Database error: {0}")]
    DbError(String),
    #[error(transparent)]
    RLPDecode(#[from] RLPDecodeError),
    #[error("{0}")]
    Custom(String),
}
