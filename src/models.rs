use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A known peer and where the relationship with it stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub peer_id: String,
    pub name: String,
    pub status: ContactStatus,
    pub added_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(peer_id: impl Into<String>, name: impl Into<String>, status: ContactStatus) -> Self {
        Contact {
            peer_id: peer_id.into(),
            name: name.into(),
            status,
            added_at: Utc::now(),
        }
    }

    /// Deleted contacts (by us or by them) may be re-added in place.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, ContactStatus::Deleted | ContactStatus::RemotelyDeleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,         // They asked us, we haven't answered
    RequestSent,     // We asked them
    Accepted,
    Deleted,         // Removed or declined locally
    RemotelyDeleted, // They removed us
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Message {
    /// The other side of the conversation, seen from `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending = 0,   // Stored locally, not yet on the wire
    Sent = 1,      // Written to the data channel
    Delivered = 2, // Received from the peer
    Read = 3,      // Read by recipient
    Failed = 4,    // Retries exhausted
}

impl DeliveryStatus {
    /// Statuses only move forward: pending -> sent -> delivered -> read,
    /// or pending -> failed. Re-applying the current status is allowed.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Failed, _) | (_, Failed) => self == Pending && next == Failed,
            (a, b) => (b as u8) > (a as u8),
        }
    }
}

/// Connection state shared by the signaling transport and the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Coarse status of the link to the active peer, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Connecting,
    Disconnected,
    Failed,
    /// `Some(n)` while reconnection attempt `n` is running.
    Reconnecting(Option<u32>),
}

impl From<ConnectionState> for LinkStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => LinkStatus::Disconnected,
            ConnectionState::Connecting => LinkStatus::Connecting,
            ConnectionState::Connected => LinkStatus::Connected,
            ConnectionState::Reconnecting => LinkStatus::Reconnecting(None),
            ConnectionState::Failed => LinkStatus::Failed,
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Connected => f.write_str("Connected"),
            LinkStatus::Connecting => f.write_str("Connecting"),
            LinkStatus::Disconnected => f.write_str("Disconnected"),
            LinkStatus::Failed => f.write_str("Failed"),
            LinkStatus::Reconnecting(None) => f.write_str("Reconnecting"),
            LinkStatus::Reconnecting(Some(attempt)) => write!(f, "Reconnecting ({})", attempt),
        }
    }
}

/// Storage key of the conversation between two users. Symmetric in its arguments.
pub fn conversation_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("p2p_chat_messages_{}_{}", first, second)
}
