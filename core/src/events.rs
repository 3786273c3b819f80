/// Event kinds flowing between the engine's layers
use crate::transport::ConnectionState;
use crate::types::{LocalId, Message, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Emitted by the connection supervisor, in transport order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Validated inbound application message
    Message(Message),
    /// Server acknowledged a delivery; `None` when the frame names no send
    DeliveryAck(Option<LocalId>),
    /// A counterpart is typing
    TypingIndicator(UserId),
    ConnectionStateChanged(ConnectionState),
    /// A reconnect will be attempted after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Change notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A conversation's transcript gained or updated an entry
    TranscriptChanged { counterpart: UserId },
    UnreadChanged { counterpart: UserId, count: u32 },
    PresenceUpdated { online: usize },
    ConnectionStateChanged { state: ConnectionState },
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// An optimistic send was refused by the transport; the entry stays
    SendFailed { local_id: LocalId },
    Typing { counterpart: UserId },
    RosterChanged { size: usize },
}
