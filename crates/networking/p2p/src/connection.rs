use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::PeerConnectionError;
use crate::messages::Message;

/// A request handed to the transport task serving one peer, together with
/// the channel the matching response must be sent back on.
#[derive(Debug)]
pub struct OutboundRequest {
    pub message: Message,
    pub reply: oneshot::Sender<Message>,
}

/// Handle to the transport task of one peer. The engine issues typed
/// requests through it and never sees the wire.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    sender: mpsc::UnboundedSender<OutboundRequest>,
}

impl PeerConnection {
    /// Creates the engine-side handle and the transport-side receiver. The
    /// transport (or a scripted test peer) consumes `OutboundRequest`s and
    /// answers on their reply channels.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Sends a request and waits for the matching response or the timeout.
    /// The response must carry the request's id.
    pub async fn outgoing_request(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, PeerConnectionError> {
        let request_id = message.request_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(OutboundRequest {
                message,
                reply: reply_tx,
            })
            .map_err(|_| PeerConnectionError::Closed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => {
                if response.request_id() != request_id {
                    return Err(PeerConnectionError::RequestIdMismatch);
                }
                Ok(response)
            }
            Ok(Err(_closed)) => Err(PeerConnectionError::Closed),
            Err(_timeout) => Err(PeerConnectionError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BlockHeaders, GetBlockHeaders, HashOrNumber};

    #[tokio::test]
    async fn request_is_answered_on_the_reply_channel() {
        let (mut connection, mut transport) = PeerConnection::channel();

        tokio::spawn(async move {
            let request = transport.recv().await.unwrap();
            let id = request.message.request_id();
            let _ = request.reply.send(Message::BlockHeaders(BlockHeaders {
                id,
                block_headers: vec![],
            }));
        });

        let response = connection
            .outgoing_request(
                Message::GetBlockHeaders(GetBlockHeaders {
                    id: 99,
                    startblock: HashOrNumber::Number(1),
                    limit: 10,
                    skip: 0,
                    reverse: false,
                }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.request_id(), 99);
    }

    #[tokio::test]
    async fn mismatched_response_id_is_an_error() {
        let (mut connection, mut transport) = PeerConnection::channel();

        tokio::spawn(async move {
            let request = transport.recv().await.unwrap();
            let _ = request.reply.send(Message::BlockHeaders(BlockHeaders {
                id: request.message.request_id() + 1,
                block_headers: vec![],
            }));
        });

        let result = connection
            .outgoing_request(
                Message::GetBlockHeaders(GetBlockHeaders {
                    id: 7,
                    startblock: HashOrNumber::Number(1),
                    limit: 1,
                    skip: 0,
                    reverse: false,
                }),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result, Err(PeerConnectionError::RequestIdMismatch));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (mut connection, _transport) = PeerConnection::channel();
        let result = connection
            .outgoing_request(
                Message::GetBlockHeaders(GetBlockHeaders {
                    id: 1,
                    startblock: HashOrNumber::Number(1),
                    limit: 1,
                    skip: 0,
                    reverse: false,
                }),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(result, Err(PeerConnectionError::Timeout));
    }
}
