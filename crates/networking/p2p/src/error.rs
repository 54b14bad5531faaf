use thiserror::Error;

use ember_storage::error::StoreError;

use crate::peer_table::PeerTableError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PeerTable(#[from] PeerTableError),
    #[error("Pivot block selection failed {0} times, giving up")]
    PivotUpdateFailuresExhausted(u32),
    #[error("Sync coordinator channel closed")]
    ChannelClosed,
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerConnectionError {
    #[error("Timeout while waiting for peer response")]
    Timeout,
    #[error("Peer connection closed")]
    Closed,
    #[error("Response id does not match request id")]
    RequestIdMismatch,
}
