//! Wire protocol between sessions and the sequencer.
//!
//! Frames are bincode-encoded (serde mode, standard config). Mutation
//! envelopes travel as JSON strings inside op batches so the sequencer never
//! has to understand them:
//! ```text
//!  client ── Join ─────────────► sequencer
//!         ◄─ InitialState ─────  { clientId, summary, ops since summary }
//!         ── SubmitOps ────────►  { version, ops: [json, ..] }
//!         ◄─ OpsSequenced ─────   { clientId, sequenceNumber, version, ops }
//! ```
//! The author receives its own batch back; that echo is the Ack.

use cadence_core::{OutboundBatch, Summary};
use serde::{Deserialize, Serialize};

/// Sequencer-assigned connection id.
pub type ClientId = u64;

/// A connected user as announced to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub client_id: ClientId,
    pub name: String,
    /// 0xRRGGBB display colour
    pub color: u32,
}

/// Local mutations flushed by a session, all stamped with one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOps {
    pub version: u64,
    pub ops: Vec<String>,
}

impl SubmitOps {
    /// Encode a drained outbound batch for the wire.
    pub fn from_batch(batch: &OutboundBatch) -> Result<Self, ProtocolError> {
        let ops = batch
            .encode_ops()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            version: batch.version,
            ops,
        })
    }
}

/// A submitted batch after ordering. Order within and across batches is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOpBatch {
    pub client_id: ClientId,
    pub sequence_number: String,
    pub version: u64,
    pub ops: Vec<String>,
}

impl SequencedOpBatch {
    /// Parsed sequence number, `None` when malformed.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence_number.parse().ok()
    }
}

/// Latest summary plus every batch sequenced after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    #[serde(with = "json_string")]
    pub summary: Summary,
    pub ops: Vec<SequencedOpBatch>,
    /// Sequence number the summary was taken at
    pub sequence_number: u64,
}

/// First message a joining session receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    pub client_id: ClientId,
    pub document: DocumentState,
    pub connected_users: Vec<UserInfo>,
}

/// A session's answer to `RequestSummary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryResponse {
    Summary {
        sequence_number: u64,
        #[serde(with = "json_string")]
        summary: Summary,
    },
    Unavailable {
        reason: String,
    },
}

/// Messages from session to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on a connection
    Join { document_id: String, name: String },
    SubmitOps(SubmitOps),
    Summary(SummaryResponse),
    Ping,
}

/// Messages from server to session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    InitialState(InitialState),
    OpsSequenced(SequencedOpBatch),
    UserJoined(UserInfo),
    UserLeft(UserInfo),
    /// Addressed to one client; everyone else ignores it.
    RequestSummary { client_id: ClientId },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Summaries are self-describing JSON, which bincode cannot decode
/// directly, so frames carry them as a string.
mod json_string {
    use cadence_core::Summary;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(summary: &Summary, serializer: S) -> Result<S::Ok, S::Error> {
        let json = summary.to_json().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&json)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Summary, D::Error> {
        let json = String::deserialize(deserializer)?;
        Summary::from_json(&json).map_err(serde::de::Error::custom)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessage(String),
    ConnectionClosed,
    Timeout,
    HandshakeFailed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessage(e) => write!(f, "Invalid message: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::HandshakeFailed(e) => write!(f, "Handshake failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
