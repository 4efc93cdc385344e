use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved `to` value addressing every other registered identity.
pub const BROADCAST_MARKER: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Message {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        message: String,
    },
}

/// The only frame the relay ever sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Broadcast,
    User(String),
}

impl Recipient {
    /// Absent, empty and `"all"` addresses all mean broadcast.
    pub fn from_wire(to: Option<String>) -> Self {
        match to {
            Some(to) if !to.is_empty() && to != BROADCAST_MARKER => Recipient::User(to),
            _ => Recipient::Broadcast,
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Login {
        user_id: String,
    },
    Message {
        from: String,
        to: Recipient,
        payload: String,
    },
}

impl From<ClientFrame> for Envelope {
    fn from(frame: ClientFrame) -> Self {
        match frame {
            ClientFrame::Login { user_id } => Envelope::Login { user_id },
            ClientFrame::Message { from, to, message } => Envelope::Message {
                from,
                to: Recipient::from_wire(to),
                payload: message,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("frame is not a valid envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub fn decode_text(text: &str) -> Result<Envelope, FrameError> {
    let frame: ClientFrame = serde_json::from_str(text.trim())?;
    Ok(frame.into())
}

pub fn decode_binary(bytes: &[u8]) -> Result<Envelope, FrameError> {
    let text = std::str::from_utf8(bytes)?;
    decode_text(text)
}

pub fn encode<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}
