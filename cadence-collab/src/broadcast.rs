//! Fan-out of sequencer frames to every session in a document room.
//!
//! Uses a tokio broadcast channel so one encode serves all subscribers.
//! Each user gets an independent receiver that buffers up to `capacity`
//! frames; a receiver that falls further behind lags and loses frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ClientId, ProtocolError, ServerMessage, UserInfo};

/// Display colours handed out to users, first unused wins.
pub const USER_COLORS: [u32; 9] = [
    0xFF4B60, 0xFFA14B, 0xF5DD42, 0x90F542, 0x42F5A4, 0x2FD1ED, 0x3455F7, 0xA635FC, 0xE329AB,
];

/// Broadcast statistics.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_users: usize,
}

/// A broadcast group for a single document room.
///
/// Sequenced batches go to every user, the author included.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    users: Arc<RwLock<HashMap<ClientId, UserInfo>>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group whose receivers buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            users: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a user and return the receiver its connection drains.
    pub async fn add_user(&self, info: UserInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut users = self.users.write().await;
        users.insert(info.client_id, info);
        self.sender.subscribe()
    }

    /// Remove a user. Returns its info if it was registered.
    pub async fn remove_user(&self, client_id: ClientId) -> Option<UserInfo> {
        self.users.write().await.remove(&client_id)
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Fan out an already encoded frame. Returns the number of receivers.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// First palette colour no connected user has; the last one when all
    /// are taken.
    pub async fn next_color(&self) -> u32 {
        let users = self.users.read().await;
        USER_COLORS
            .iter()
            .copied()
            .find(|color| users.values().all(|user| user.color != *color))
            .unwrap_or(USER_COLORS[USER_COLORS.len() - 1])
    }

    /// Number of connected users.
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Connected users ordered by client id.
    pub async fn users(&self) -> Vec<UserInfo> {
        let mut users: Vec<_> = self.users.read().await.values().cloned().collect();
        users.sort_by_key(|user| user.client_id);
        users
    }

    /// Check if a user is connected.
    pub async fn has_user(&self, client_id: ClientId) -> bool {
        self.users.read().await.contains_key(&client_id)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_users: self.users.read().await.len(),
        }
    }

    /// Per-receiver frame buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
