//! # cadence-collab: Sequenced multi-client sync for cadence documents
//!
//! Sessions submit local mutation batches to a single ordering authority
//! and apply the totally ordered stream it broadcasts back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ SyncSession │ ◄─────────────────► │ SequencerServer │
//! │ (per user)  │   bincode frames    │ (central)       │
//! └──────┬──────┘                     └────────┬────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌───────────────────┐              ┌─────────────────┐
//! │ UpdateCoordinator │              │ OrderingService │
//! │ (local document)  │              │ summary + log   │
//! └───────────────────┘              └────────┬────────┘
//!                                             │
//!                                     ┌───────┴────────┐
//!                                     │ BroadcastGroup │
//!                                     │ (fan-out)      │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages (bincode-encoded)
//! - [`transport`]: WebSocket and in-process transports
//! - [`session`]: Client session: handshake, replay, flush, acks
//! - [`sequencer`]: Per-document ordering service
//! - [`broadcast`]: Room fan-out and user colours
//! - [`server`]: WebSocket sequencer server

pub mod protocol;
pub mod transport;
pub mod session;
pub mod sequencer;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ClientId, ClientMessage, DocumentState, InitialState, ProtocolError, SequencedOpBatch,
    ServerMessage, SubmitOps, SummaryResponse, UserInfo,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, USER_COLORS};
pub use sequencer::OrderingService;
pub use server::{SequencerServer, ServerConfig, ServerStats};
pub use session::{SessionConfig, SessionEvent, SyncSession};
pub use transport::{ChannelHost, ChannelTransport, Transport, WebSocketTransport};
