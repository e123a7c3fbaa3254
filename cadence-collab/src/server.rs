//! WebSocket sequencer server with room-per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document_id) ── OrderingService ── BroadcastGroup
//! Client B ──┘                                                  │
//!                                                  ┌────────────┼────────────┐
//!                                                  ▼            ▼            ▼
//!                                               Client A     Client B     Client C
//! ```
//!
//! Each room sequences submitted batches and fans them out to every
//! connected session, the author included. Sequencing and fan-out happen
//! under the room lock so broadcast order equals sequence order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadence_core::Summary;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{
    ClientId, ClientMessage, InitialState, ServerMessage, SubmitOps, SummaryResponse, UserInfo,
};
use crate::sequencer::OrderingService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Mutations since the last summary before one is requested
    pub summary_threshold: usize,
    /// Document a new room starts from
    pub initial_document: Summary,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            summary_threshold: 1000,
            initial_document: Summary::empty_list("root"),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub sequenced_batches: u64,
    pub active_rooms: usize,
}

struct DocumentRoom {
    ordering: OrderingService,
    broadcast: Arc<BroadcastGroup>,
    /// Client asked for a summary that has not answered yet
    summary_requested_from: Option<ClientId>,
}

impl DocumentRoom {
    fn new(config: &ServerConfig) -> Self {
        Self {
            ordering: OrderingService::new(config.initial_document.clone()),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            summary_requested_from: None,
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, DocumentRoom>>>;

/// Connection joined to a room.
struct Member {
    document_id: String,
    user: UserInfo,
}

/// Sequencer server handling document rooms over WebSocket.
pub struct SequencerServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
    next_client_id: Arc<AtomicU64>,
}

impl SequencerServer {
    /// Create a server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a server with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sequencer listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let next_client_id = self.next_client_id.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, next_client_id).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        next_client_id: Arc<AtomicU64>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let msg = match ClientMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match msg {
                                ClientMessage::Join { document_id, name } => {
                                    if member.is_some() {
                                        log::warn!("Ignoring second join from {addr}");
                                        continue;
                                    }
                                    let client_id = next_client_id.fetch_add(1, Ordering::Relaxed);
                                    let (joined, rx, initial) =
                                        Self::join(&rooms, &config, document_id, name, client_id).await;
                                    broadcast_rx = Some(rx);

                                    ws_sender
                                        .send(Message::Binary(ServerMessage::InitialState(initial).encode()?.into()))
                                        .await?;
                                    if let Some(group) = Self::room_broadcast(&rooms, &joined.document_id).await {
                                        group.broadcast(&ServerMessage::UserJoined(joined.user.clone()))?;
                                    }
                                    stats.write().await.active_rooms = rooms.read().await.len();
                                    log::info!(
                                        "User {} ({}) joined {}",
                                        joined.user.name,
                                        joined.user.client_id,
                                        joined.document_id
                                    );
                                    member = Some(joined);
                                }

                                ClientMessage::SubmitOps(submit) => {
                                    let Some(joined) = &member else {
                                        log::warn!("SubmitOps before join from {addr}");
                                        continue;
                                    };
                                    Self::sequence(&rooms, &config, joined, submit).await?;
                                    stats.write().await.sequenced_batches += 1;
                                }

                                ClientMessage::Summary(response) => {
                                    if let Some(joined) = &member {
                                        Self::store_summary(&rooms, joined, response).await;
                                    }
                                }

                                ClientMessage::Ping => {
                                    ws_sender.send(Message::Binary(ServerMessage::Pong.encode()?.into())).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => Self::next_frame(rx, addr).await,
                        // Not joined yet
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Some(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        None => {
                            ws_sender.send(Message::Close(None)).await.ok();
                            break;
                        }
                    }
                }
            }
        }

        if let Some(joined) = member {
            Self::leave(&rooms, joined).await;
        }
        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.read().await.len();
        Ok(())
    }

    /// Next broadcast frame for a connection. A receiver that lagged has
    /// lost sequenced batches for good, so it yields `None` and the client
    /// has to rejoin from a fresh initial state.
    async fn next_frame(
        rx: &mut broadcast::Receiver<Arc<Vec<u8>>>,
        addr: SocketAddr,
    ) -> Option<Arc<Vec<u8>>> {
        match rx.recv().await {
            Ok(data) => Some(data),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Connection {addr} lagged by {n} messages, closing");
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Register a user in the room and capture the document state. The
    /// receiver is subscribed under the same lock as the snapshot, so it
    /// sees exactly the batches sequenced after it.
    async fn join(
        rooms: &Rooms,
        config: &ServerConfig,
        document_id: String,
        name: String,
        client_id: ClientId,
    ) -> (Member, broadcast::Receiver<Arc<Vec<u8>>>, InitialState) {
        let mut rooms_w = rooms.write().await;
        let room = rooms_w
            .entry(document_id.clone())
            .or_insert_with(|| DocumentRoom::new(config));

        let connected_users = room.broadcast.users().await;
        let user = UserInfo {
            client_id,
            name,
            color: room.broadcast.next_color().await,
        };
        let rx = room.broadcast.add_user(user.clone()).await;
        let initial = InitialState {
            client_id,
            document: room.ordering.messages_since_last_summary(),
            connected_users,
        };
        (Member { document_id, user }, rx, initial)
    }

    async fn room_broadcast(rooms: &Rooms, document_id: &str) -> Option<Arc<BroadcastGroup>> {
        rooms.read().await.get(document_id).map(|room| room.broadcast.clone())
    }

    /// Sequence a batch and fan it out. Past the threshold the author is
    /// asked for a summary unless another client still owes one; the
    /// request follows the batch on the same channel, so the author has
    /// seen its own ack by then.
    async fn sequence(
        rooms: &Rooms,
        config: &ServerConfig,
        member: &Member,
        submit: SubmitOps,
    ) -> Result<(), BoxError> {
        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&member.document_id) else {
            return Ok(());
        };
        let batch = room.ordering.append_ops(member.user.client_id, submit);
        log::trace!(
            "Sequenced batch {} from {} in {}",
            batch.sequence_number,
            member.user.client_id,
            member.document_id
        );
        room.broadcast.broadcast(&ServerMessage::OpsSequenced(batch))?;

        if room.ordering.needs_summary(config.summary_threshold)
            && room.summary_requested_from.is_none()
        {
            room.summary_requested_from = Some(member.user.client_id);
            log::info!(
                "Requesting summary for {} from client {}",
                member.document_id,
                member.user.client_id
            );
            room.broadcast.broadcast(&ServerMessage::RequestSummary {
                client_id: member.user.client_id,
            })?;
        }
        Ok(())
    }

    async fn store_summary(rooms: &Rooms, member: &Member, response: SummaryResponse) {
        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&member.document_id) else {
            return;
        };
        if room.summary_requested_from == Some(member.user.client_id) {
            room.summary_requested_from = None;
        }
        match response {
            SummaryResponse::Summary {
                sequence_number,
                summary,
            } => {
                room.ordering.append_summary(sequence_number, summary);
            }
            SummaryResponse::Unavailable { reason } => {
                log::info!(
                    "Client {} could not provide a summary: {reason}",
                    member.user.client_id
                );
            }
        }
    }

    /// Rooms outlive their last user; the document stays available for the
    /// next join. A summary the leaving client still owes is asked of the
    /// next submitter instead.
    async fn leave(rooms: &Rooms, member: Member) {
        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(&member.document_id) else {
            return;
        };
        if room.summary_requested_from == Some(member.user.client_id) {
            log::info!(
                "Client {} left before answering the summary request",
                member.user.client_id
            );
            room.summary_requested_from = None;
        }
        if let Some(user) = room.broadcast.remove_user(member.user.client_id).await {
            if let Err(e) = room.broadcast.broadcast(&ServerMessage::UserLeft(user)) {
                log::warn!("Failed to announce departure: {e}");
            }
        }
        if room.broadcast.user_count().await == 0 {
            log::info!("Room {} is idle", member.document_id);
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Address the server listens on.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
