//! Client sync session: one connection, one document, one coordinator.
//!
//! ```text
//!  connect ── Join ──► await InitialState ──► rebuild from summary
//!                                              replay ops since summary
//!  next_event loop:
//!    transport message ──► OpsSequenced ──► coordinator.process
//!    flush timer / pressure ──► take_outbound ──► SubmitOps
//! ```
//!
//! Everything runs on the caller's task; the only suspension points are the
//! handshake and each `next_event` await.

use std::collections::BTreeMap;
use std::time::Duration;

use cadence_core::{Mutation, MutationContext, UpdateCoordinator};
use tokio::time::{Interval, MissedTickBehavior};

use crate::protocol::{
    ClientId, ClientMessage, ProtocolError, SequencedOpBatch, ServerMessage, SubmitOps,
    SummaryResponse, UserInfo,
};
use crate::transport::{Transport, WebSocketTransport};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub document_id: String,
    pub user_name: String,
    /// Period of the local-mutation flush timer
    pub flush_interval: Duration,
    /// Queued mutations that trigger an immediate flush
    pub max_pending_ops: usize,
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            document_id: "default".to_string(),
            user_name: "Guest".to_string(),
            flush_interval: Duration::from_millis(25),
            max_pending_ops: 50,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Events surfaced to the host from [`SyncSession::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Another client's batch was applied
    RemoteOps { client_id: ClientId, sequence_number: u64 },
    /// Our own batch came back sequenced
    Acknowledged { version: u64, sequence_number: u64 },
    UserJoined(UserInfo),
    UserLeft(UserInfo),
    /// The sequencer asked us for a summary
    SummaryRequested { provided: bool },
    /// Connection lost. Reconnect with a fresh [`SyncSession::connect`].
    Disconnected,
}

enum Step {
    Message(Option<Result<ServerMessage, ProtocolError>>),
    Flush,
}

/// A client connection to one document, driving an [`UpdateCoordinator`]
/// from the sequenced stream.
pub struct SyncSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    client_id: ClientId,
    coordinator: UpdateCoordinator,
    users: BTreeMap<ClientId, UserInfo>,
    last_sequence: u64,
    flush_timer: Interval,
    closed: bool,
}

impl SyncSession<WebSocketTransport> {
    /// Connect over WebSocket and join the configured document.
    pub async fn connect_url(url: &str, config: SessionConfig) -> Result<Self, ProtocolError> {
        let transport = WebSocketTransport::connect(url).await?;
        Self::connect(transport, config).await
    }
}

impl<T: Transport> SyncSession<T> {
    /// Join the document and bootstrap from the initial state. No mutation
    /// is applied before the initial state arrives.
    pub async fn connect(mut transport: T, config: SessionConfig) -> Result<Self, ProtocolError> {
        transport
            .send(ClientMessage::Join {
                document_id: config.document_id.clone(),
                name: config.user_name.clone(),
            })
            .await?;

        let mut early = Vec::new();
        let handshake = async {
            loop {
                match transport.recv().await {
                    Some(Ok(ServerMessage::InitialState(state))) => return Ok(state),
                    Some(Ok(ServerMessage::OpsSequenced(batch))) => early.push(batch),
                    Some(Ok(other)) => log::debug!("Ignoring {other:?} before initial state"),
                    Some(Err(e)) => return Err(e),
                    None => return Err(ProtocolError::ConnectionClosed),
                }
            }
        };
        let initial = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        let document = initial.document;
        log::info!(
            "Joined {} as client {} at sequence {} with {} pending batches",
            config.document_id,
            initial.client_id,
            document.sequence_number,
            document.ops.len() + early.len()
        );

        let start = tokio::time::Instant::now() + config.flush_interval;
        let mut flush_timer = tokio::time::interval_at(start, config.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session = Self {
            transport,
            config,
            client_id: initial.client_id,
            coordinator: UpdateCoordinator::from_summary(&document.summary),
            users: initial
                .connected_users
                .into_iter()
                .map(|user| (user.client_id, user))
                .collect(),
            last_sequence: document.sequence_number,
            flush_timer,
            closed: false,
        };
        for batch in document.ops.iter().chain(early.iter()) {
            session.apply_batch(batch)?;
        }
        Ok(session)
    }

    /// Client id the sequencer assigned on join.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The local document.
    pub fn coordinator(&self) -> &UpdateCoordinator {
        &self.coordinator
    }

    /// Local edits go through the coordinator; they are sent on the next
    /// flush.
    pub fn coordinator_mut(&mut self) -> &mut UpdateCoordinator {
        &mut self.coordinator
    }

    /// Other users currently connected to the document.
    pub fn users(&self) -> impl Iterator<Item = &UserInfo> {
        self.users.values()
    }

    /// Sequence number of the last batch applied.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Whether the connection is gone. A closed session stays closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send every queued local mutation as one batch.
    pub async fn flush(&mut self) -> Result<bool, ProtocolError> {
        let Some(batch) = self.coordinator.take_outbound() else {
            return Ok(false);
        };
        let submit = SubmitOps::from_batch(&batch)?;
        log::trace!("Submitting {} ops at version {}", submit.ops.len(), submit.version);
        self.transport.send(ClientMessage::SubmitOps(submit)).await?;
        Ok(true)
    }

    /// Send a heartbeat; the server answers with `Pong`.
    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        self.transport.send(ClientMessage::Ping).await
    }

    /// Drive the session until something the host should know about
    /// happens. Flushes local mutations on the timer and under pressure.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            if self.closed {
                return SessionEvent::Disconnected;
            }
            if self.coordinator.pending_outbound() >= self.config.max_pending_ops {
                if let Err(e) = self.flush().await {
                    return self.disconnect(e);
                }
            }

            let step = tokio::select! {
                msg = self.transport.recv() => Step::Message(msg),
                _ = self.flush_timer.tick() => Step::Flush,
            };

            match step {
                Step::Flush => {
                    if let Err(e) = self.flush().await {
                        return self.disconnect(e);
                    }
                }
                Step::Message(None) => return self.disconnect(ProtocolError::ConnectionClosed),
                Step::Message(Some(Err(e))) => log::warn!("Dropping undecodable message: {e}"),
                Step::Message(Some(Ok(msg))) => match self.handle_message(msg).await {
                    Ok(Some(event)) => return event,
                    Ok(None) => {}
                    Err(e) => return self.disconnect(e),
                },
            }
        }
    }

    fn disconnect(&mut self, reason: ProtocolError) -> SessionEvent {
        log::info!("Session {} disconnected: {reason}", self.client_id);
        self.closed = true;
        SessionEvent::Disconnected
    }

    async fn handle_message(&mut self, msg: ServerMessage) -> Result<Option<SessionEvent>, ProtocolError> {
        let event = match msg {
            ServerMessage::OpsSequenced(batch) => self.apply_batch(&batch)?,
            ServerMessage::UserJoined(user) => {
                if user.client_id == self.client_id {
                    return Ok(None);
                }
                self.users.insert(user.client_id, user.clone());
                Some(SessionEvent::UserJoined(user))
            }
            ServerMessage::UserLeft(user) => {
                self.users.remove(&user.client_id);
                Some(SessionEvent::UserLeft(user))
            }
            ServerMessage::RequestSummary { client_id } => {
                if client_id != self.client_id {
                    return Ok(None);
                }
                let provided = self.respond_to_summary_request().await?;
                Some(SessionEvent::SummaryRequested { provided })
            }
            ServerMessage::InitialState(_) => {
                log::warn!("Ignoring repeated initial state");
                None
            }
            ServerMessage::Pong => {
                log::trace!("Pong");
                None
            }
        };
        Ok(event)
    }

    async fn respond_to_summary_request(&mut self) -> Result<bool, ProtocolError> {
        let response = if self.coordinator.has_unacknowledged() {
            SummaryResponse::Unavailable {
                reason: "local edits awaiting acknowledgement".to_string(),
            }
        } else {
            SummaryResponse::Summary {
                sequence_number: self.last_sequence,
                summary: self.coordinator.summary(),
            }
        };
        let provided = matches!(response, SummaryResponse::Summary { .. });
        self.transport.send(ClientMessage::Summary(response)).await?;
        Ok(provided)
    }

    /// Apply one sequenced batch. Our own batches are acks; everything else
    /// is remote. Batches at or below the last applied sequence are stale.
    /// A skipped sequence number means batches were lost and the local
    /// document can no longer converge, so it ends the session.
    fn apply_batch(&mut self, batch: &SequencedOpBatch) -> Result<Option<SessionEvent>, ProtocolError> {
        let Some(sequence_number) = batch.sequence() else {
            log::warn!("Ignoring batch with bad sequence number {:?}", batch.sequence_number);
            return Ok(None);
        };
        if sequence_number <= self.last_sequence {
            log::debug!("Skipping already applied batch {sequence_number}");
            return Ok(None);
        }
        if sequence_number != self.last_sequence + 1 {
            return Err(ProtocolError::InvalidMessage(format!(
                "batch {sequence_number} arrived after {}",
                self.last_sequence
            )));
        }
        self.last_sequence = sequence_number;

        let own = batch.client_id == self.client_id;
        let ctx = if own {
            MutationContext::ack(batch.version)
        } else {
            MutationContext::remote(sequence_number)
        };
        for op in &batch.ops {
            match Mutation::decode(op) {
                Ok(mutation) => {
                    self.coordinator.process(&mutation, ctx);
                }
                Err(e) => log::warn!("Skipping undecodable op in batch {sequence_number}: {e}"),
            }
        }

        Ok(Some(if own {
            SessionEvent::Acknowledged {
                version: batch.version,
                sequence_number,
            }
        } else {
            SessionEvent::RemoteOps {
                client_id: batch.client_id,
                sequence_number,
            }
        }))
    }
}
