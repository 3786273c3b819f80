/// Wire frames exchanged over the duplex transport
use crate::error::{ChatError, Result};
use crate::types::{LocalId, Message, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame types, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First outbound frame after the transport opens
    Connect { user_id: String, token: String },

    /// Application message, inbound or outbound
    Message(Message),

    /// Server acknowledgement of a delivered message
    Delivered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<LocalId>,
    },

    /// Counterpart is typing
    Typing {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    /// Polite goodbye before a local close
    Disconnect,
}

impl Frame {
    /// Serialize frame to JSON text
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate an inbound text frame
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| ChatError::MalformedFrame(format!("{}: {}", e, preview(text))))?;
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Frame::Message(msg) if msg.content.is_empty() => Err(ChatError::MalformedFrame(
                "message frame without content".to_string(),
            )),
            Frame::Connect { .. } | Frame::Disconnect => Err(ChatError::MalformedFrame(format!(
                "unexpected inbound {} frame",
                self.frame_type()
            ))),
            _ => Ok(()),
        }
    }

    /// Get frame type as string
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "connect",
            Frame::Message(_) => "message",
            Frame::Delivered { .. } => "delivered",
            Frame::Typing { .. } => "typing",
            Frame::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.frame_type())
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
