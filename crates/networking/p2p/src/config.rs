use std::time::Duration;

/// Tuning knobs of the fast-sync engine. The defaults are sized for a public
/// proof-of-work network; tests override individual fields.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of headers asked for in one request.
    pub block_headers_per_request: u64,
    /// Maximum number of bodies asked for in one request.
    pub block_bodies_per_request: usize,
    /// Maximum number of receipt lists asked for in one request.
    pub receipts_per_request: usize,
    /// Maximum number of trie nodes asked for in one request.
    pub nodes_per_request: usize,
    /// Cap on outstanding requests across all peers.
    pub max_concurrent_requests: usize,
    /// Minimum spacing between two requests to the same peer.
    pub fast_sync_throttle: Duration,
    /// How long a request handler waits for the matching response.
    pub peer_response_timeout: Duration,
    /// Heartbeat interval of the coordinator.
    pub sync_retry_interval: Duration,
    /// Ban duration for protocol violations.
    pub blacklist_duration: Duration,
    /// Ban duration for proof-of-work and payload validation failures.
    pub critical_blacklist_duration: Duration,
    /// Distance behind the best advertised tip at which the pivot is chosen.
    pub pivot_block_offset: u64,
    /// Distance the network tip must move past the pivot before the pivot is
    /// considered stale.
    pub max_pivot_block_age: u64,
    /// A freshly selected pivot within this distance of the current one does
    /// not replace it.
    pub max_target_difference: u64,
    /// Number of agreeing peers required to accept a pivot header.
    pub min_peers_to_choose_pivot_block: usize,
    /// Backoff before pivot selection is retried.
    pub pivot_block_reschedule_interval: Duration,
    /// Pivot update failures tolerated before the sync gives up.
    pub maximum_target_update_failures: u32,
    /// How many blocks are discarded when header validation fails.
    pub fast_sync_block_validation_n: u64,
    /// Average stride between fully validated headers.
    pub fast_sync_block_validation_k: u64,
    /// Headers fetched past the pivot so validation momentum carries through.
    pub fast_sync_block_validation_x: u64,
    /// Interval between sync-state snapshots.
    pub persist_state_snapshot_interval: Duration,
    /// Interval between status log lines.
    pub print_status_interval: Duration,
    /// Size in bits of the known-nodes bloom filter of the state scheduler.
    pub state_sync_bloom_filter_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_headers_per_request: 200,
            block_bodies_per_request: 128,
            receipts_per_request: 60,
            nodes_per_request: 200,
            max_concurrent_requests: 50,
            fast_sync_throttle: Duration::from_secs(2),
            peer_response_timeout: Duration::from_secs(30),
            sync_retry_interval: Duration::from_secs(5),
            blacklist_duration: Duration::from_secs(200),
            critical_blacklist_duration: Duration::from_secs(600),
            pivot_block_offset: 32,
            max_pivot_block_age: 96,
            max_target_difference: 5,
            min_peers_to_choose_pivot_block: 3,
            pivot_block_reschedule_interval: Duration::from_secs(15),
            maximum_target_update_failures: 5,
            fast_sync_block_validation_n: 2048,
            fast_sync_block_validation_k: 100,
            fast_sync_block_validation_x: 50,
            persist_state_snapshot_interval: Duration::from_secs(60),
            print_status_interval: Duration::from_secs(30),
            state_sync_bloom_filter_size: 20_000_000,
        }
    }
}
