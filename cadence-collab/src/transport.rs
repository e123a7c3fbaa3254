//! Byte transport between a session and the sequencer.
//!
//! The session only needs "send a client message" and "receive the next
//! server message, in order". [`WebSocketTransport`] speaks binary frames to
//! a [`SequencerServer`](crate::server::SequencerServer);
//! [`ChannelTransport`] connects to an in-process host.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Bidirectional message channel between a session and the sequencer.
pub trait Transport: Send {
    fn send(&mut self, msg: ClientMessage) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Next message from the sequencer. `None` once the connection is gone.
    /// Must be cancel safe: the session races it against its flush timer.
    fn recv(&mut self) -> impl Future<Output = Option<Result<ServerMessage, ProtocolError>>> + Send;
}

/// Transport over a tungstenite WebSocket stream.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::HandshakeFailed(e.to_string()))?;
        log::debug!("Connected to sequencer at {url}");
        Ok(Self { stream })
    }
}

impl Transport for WebSocketTransport {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.stream
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, ProtocolError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(ServerMessage::decode(&data)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Text(_)) => {
                    return Some(Err(ProtocolError::InvalidMessage("unexpected text frame".into())));
                }
                // Ping/pong frames are answered by tungstenite.
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket error: {e}");
                    return None;
                }
            }
        }
    }
}

/// Session side of an in-process connection.
pub struct ChannelTransport {
    outgoing: mpsc::Sender<ClientMessage>,
    incoming: mpsc::Receiver<ServerMessage>,
}

/// Host side of an in-process connection.
pub struct ChannelHost {
    pub incoming: mpsc::Receiver<ClientMessage>,
    pub outgoing: mpsc::Sender<ServerMessage>,
}

impl ChannelTransport {
    /// Create a connected session/host pair with bounded queues.
    pub fn pair(capacity: usize) -> (ChannelTransport, ChannelHost) {
        let (client_tx, client_rx) = mpsc::channel(capacity);
        let (server_tx, server_rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                outgoing: client_tx,
                incoming: server_rx,
            },
            ChannelHost {
                incoming: client_rx,
                outgoing: server_tx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, ProtocolError>> {
        self.incoming.recv().await.map(Ok)
    }
}
