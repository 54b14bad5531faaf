use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

use ember_common::H256;
use ember_common::types::BlockNumber;

use crate::connection::PeerConnection;

pub type PeerId = H256;

#[derive(Debug, Error)]
pub enum PeerTableError {
    #[error("Failed to lock the peer table")]
    LockError,
}

/// A handshaked peer as seen by the sync engine. The peer lifecycle itself
/// is run by the external peer manager; the engine only records handshake
/// and disconnect events.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connection: PeerConnection,
}

/// What a peer has advertised about itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerInfo {
    pub max_block_number: BlockNumber,
}

#[derive(Debug)]
struct BanEntry {
    until: Instant,
    reason: String,
}

#[derive(Debug, Default)]
struct PeerTableInner {
    peers: HashMap<PeerId, (Peer, PeerInfo)>,
    blacklist: HashMap<PeerId, BanEntry>,
}

/// Registry of handshaked peers plus the time-bounded ban list. Read by the
/// coordinator and the state scheduler, written on peer events and on
/// blacklisting decisions.
#[derive(Debug, Clone, Default)]
pub struct PeerTable(Arc<Mutex<PeerTableInner>>);

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, PeerTableInner>, PeerTableError> {
        self.0.lock().map_err(|_| PeerTableError::LockError)
    }

    pub fn insert_peer(
        &self,
        peer: Peer,
        max_block_number: BlockNumber,
    ) -> Result<(), PeerTableError> {
        debug!(peer_id = %peer.id, max_block_number, "Peer handshaked");
        self.inner()?
            .peers
            .insert(peer.id, (peer, PeerInfo { max_block_number }));
        Ok(())
    }

    /// Forgets a disconnected peer. Its blacklist entry, if any, survives so
    /// a quick reconnect does not launder a ban.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Result<(), PeerTableError> {
        self.inner()?.peers.remove(peer_id);
        Ok(())
    }

    pub fn update_max_block_number(
        &self,
        peer_id: &PeerId,
        max_block_number: BlockNumber,
    ) -> Result<(), PeerTableError> {
        if let Some((_, info)) = self.inner()?.peers.get_mut(peer_id) {
            if max_block_number > info.max_block_number {
                info.max_block_number = max_block_number;
            }
        }
        Ok(())
    }

    pub fn blacklist(
        &self,
        peer_id: &PeerId,
        duration: Duration,
        reason: &str,
    ) -> Result<(), PeerTableError> {
        warn!(peer_id = %peer_id, ?duration, reason, "Blacklisting peer");
        self.inner()?.blacklist.insert(
            *peer_id,
            BanEntry {
                until: Instant::now() + duration,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    pub fn is_blacklisted(&self, peer_id: &PeerId) -> Result<bool, PeerTableError> {
        let mut inner = self.inner()?;
        match inner.blacklist.get(peer_id) {
            Some(entry) if entry.until > Instant::now() => Ok(true),
            Some(_expired) => {
                inner.blacklist.remove(peer_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn handshaked_peers(&self) -> Result<Vec<(Peer, PeerInfo)>, PeerTableError> {
        Ok(self.inner()?.peers.values().cloned().collect())
    }

    /// Handshaked peers minus currently blacklisted ones. Expired bans are
    /// dropped on the way.
    pub fn peers_to_download_from(&self) -> Result<Vec<(Peer, PeerInfo)>, PeerTableError> {
        let mut inner = self.inner()?;
        let now = Instant::now();
        inner.blacklist.retain(|_, entry| entry.until > now);
        let banned: Vec<PeerId> = inner.blacklist.keys().copied().collect();
        Ok(inner
            .peers
            .values()
            .filter(|(peer, _)| !banned.contains(&peer.id))
            .cloned()
            .collect())
    }

    pub fn peer_count(&self) -> Result<usize, PeerTableError> {
        Ok(self.inner()?.peers.len())
    }

    pub fn blacklisted_count(&self) -> Result<usize, PeerTableError> {
        let mut inner = self.inner()?;
        let now = Instant::now();
        inner.blacklist.retain(|_, entry| entry.until > now);
        Ok(inner.blacklist.len())
    }

    /// Reason string of an active ban, for the status log.
    pub fn blacklist_reason(&self, peer_id: &PeerId) -> Result<Option<String>, PeerTableError> {
        Ok(self
            .inner()?
            .blacklist
            .get(peer_id)
            .map(|entry| entry.reason.clone()))
    }
}
