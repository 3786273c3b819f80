/// Shared data model for the conversation engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Stable user identifier (integer on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(UserId)
    }
}

/// Client-generated token tying an optimistic entry to its confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(LocalId)
    }
}

/// One chat message between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
}

impl Message {
    /// Conversation key from `me`'s point of view, `None` if `me` is not a party
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        if self.sender_id == me {
            Some(self.receiver_id)
        } else if self.receiver_id == me {
            Some(self.sender_id)
        } else {
            None
        }
    }

    pub fn is_inbound(&self, me: UserId) -> bool {
        self.receiver_id == me && self.sender_id != me
    }
}

/// Lifecycle of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Optimistic echo, not yet accepted by the transport
    Pending,
    /// Written to the transport, awaiting acknowledgement
    Sent,
    /// Acknowledged by the server
    Delivered,
    /// Transport refused the send; kept for display and retry
    Failed,
    /// Arrived from the server (live push or history)
    Received,
}

impl DeliveryStatus {
    pub fn is_outbound_unconfirmed(self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::Sent | DeliveryStatus::Failed)
    }
}

/// Minimal profile resolved for each roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unnamed User"
        } else {
            &self.name
        }
    }
}

/// Point-in-time online flags, replaced wholesale on every successful poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSnapshot(pub HashMap<UserId, bool>);

impl PresenceSnapshot {
    pub fn is_online(&self, user: UserId) -> bool {
        self.0.get(&user).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
