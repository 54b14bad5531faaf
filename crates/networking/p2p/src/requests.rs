use std::time::{Duration, Instant};

use spawned_concurrency::tasks::{GenServer, GenServerHandle};
use tracing::trace;

use crate::error::PeerConnectionError;
use crate::messages::{Message, MessageKind};
use crate::peer_table::{Peer, PeerId};

/// Why an outstanding request produced no usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFailure {
    Timeout,
    ConnectionClosed,
    UnexpectedResponse,
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestFailure::Timeout => write!(f, "timeout"),
            RequestFailure::ConnectionClosed => write!(f, "connection closed"),
            RequestFailure::UnexpectedResponse => write!(f, "unexpected response"),
        }
    }
}

/// Terminal report of one request handler.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Response {
        peer_id: PeerId,
        message: Message,
        elapsed: Duration,
    },
    Failed {
        peer_id: PeerId,
        reason: RequestFailure,
    },
}

/// Spawns a short-lived handler that sends `request` to `peer`, waits for
/// the matching response or the timeout, and casts the mapped outcome back
/// into the owning agent's inbox. The handler always reports exactly once.
pub(crate) fn spawn_request<G, F>(
    handle: GenServerHandle<G>,
    peer: Peer,
    request: Message,
    expected: MessageKind,
    timeout: Duration,
    to_msg: F,
) where
    G: GenServer,
    F: FnOnce(RequestOutcome) -> G::CastMsg + Send + 'static,
{
    tokio::spawn(async move {
        let peer_id = peer.id;
        let mut connection = peer.connection;
        let started = Instant::now();
        trace!(peer_id = %peer_id, kind = ?request.kind(), "Sending request");
        let outcome = match connection.outgoing_request(request, timeout).await {
            Ok(message) if message.kind() == expected => RequestOutcome::Response {
                peer_id,
                message,
                elapsed: started.elapsed(),
            },
            Ok(_other) => RequestOutcome::Failed {
                peer_id,
                reason: RequestFailure::UnexpectedResponse,
            },
            Err(PeerConnectionError::Timeout) => RequestOutcome::Failed {
                peer_id,
                reason: RequestFailure::Timeout,
            },
            Err(_closed) => RequestOutcome::Failed {
                peer_id,
                reason: RequestFailure::ConnectionClosed,
            },
        };
        let mut handle = handle;
        let _ = handle.cast(to_msg(outcome)).await;
    });
}
