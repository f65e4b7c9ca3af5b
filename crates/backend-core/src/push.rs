use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{IncomingMessageEvent, MessageType};

/// Event kinds delivered over the push channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PushEventKind {
    #[serde(rename = "message:received")]
    MessageReceived,
    #[serde(rename = "message:read")]
    MessageRead,
    #[serde(rename = "user:online")]
    UserOnline,
    #[serde(rename = "user:offline")]
    UserOffline,
    #[serde(rename = "group:deleted")]
    GroupDeleted,
}

impl PushEventKind {
    pub const ALL: [PushEventKind; 5] = [
        Self::MessageReceived,
        Self::MessageRead,
        Self::UserOnline,
        Self::UserOffline,
        Self::GroupDeleted,
    ];

    /// Wire name of the event kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageReceived => "message:received",
            Self::MessageRead => "message:read",
            Self::UserOnline => "user:online",
            Self::UserOffline => "user:offline",
            Self::GroupDeleted => "group:deleted",
        }
    }
}

impl fmt::Display for PushEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PushEventKind {
    type Err = PushDecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| PushDecodeError::UnknownKind(value.to_owned()))
    }
}

/// Validated push event. Loosely typed frames never get past `decode_frame`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushEvent {
    MessageReceived(IncomingMessageEvent),
    MessageRead {
        conversation_id: String,
        reader_id: String,
        message_id: Option<String>,
    },
    UserOnline {
        user_id: String,
    },
    UserOffline {
        user_id: String,
    },
    GroupDeleted {
        conversation_id: String,
    },
}

impl PushEvent {
    pub fn kind(&self) -> PushEventKind {
        match self {
            Self::MessageReceived(_) => PushEventKind::MessageReceived,
            Self::MessageRead { .. } => PushEventKind::MessageRead,
            Self::UserOnline { .. } => PushEventKind::UserOnline,
            Self::UserOffline { .. } => PushEventKind::UserOffline,
            Self::GroupDeleted { .. } => PushEventKind::GroupDeleted,
        }
    }
}

/// Reasons a push frame is rejected at the channel boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushDecodeError {
    #[error("push frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("push frame has no event name")]
    MissingEventName,
    #[error("unknown push event kind '{0}'")]
    UnknownKind(String),
    #[error("push event '{kind}' is missing field '{field}'")]
    MissingField {
        kind: PushEventKind,
        field: &'static str,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decode a `{ "event": …, "data": … }` text frame into a typed event.
pub fn decode_frame(frame: &str) -> Result<PushEvent, PushDecodeError> {
    let raw: RawFrame =
        serde_json::from_str(frame).map_err(|err| PushDecodeError::InvalidJson(err.to_string()))?;
    let name = raw.event.ok_or(PushDecodeError::MissingEventName)?;
    let kind = name.parse::<PushEventKind>()?;
    decode_payload(kind, &raw.data)
}

/// Validate a payload for a known event kind.
pub fn decode_payload(kind: PushEventKind, data: &Value) -> Result<PushEvent, PushDecodeError> {
    let text = |field: &'static str| -> Result<String, PushDecodeError> {
        data.get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .ok_or(PushDecodeError::MissingField { kind, field })
    };

    match kind {
        PushEventKind::MessageReceived => {
            let conversation_id = text("conversationId")?;
            let message_id = text("messageId").or_else(|_| text("id"))?;
            let sender_id = text("senderId")?;
            let created_at = data
                .get("createdAt")
                .and_then(Value::as_i64)
                .ok_or(PushDecodeError::MissingField {
                    kind,
                    field: "createdAt",
                })?;
            let content = data
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let message_type = data
                .get("type")
                .cloned()
                .and_then(|value| serde_json::from_value::<MessageType>(value).ok())
                .unwrap_or_default();

            Ok(PushEvent::MessageReceived(IncomingMessageEvent {
                conversation_id,
                message_id,
                sender_id,
                content,
                message_type,
                created_at,
            }))
        }
        PushEventKind::MessageRead => Ok(PushEvent::MessageRead {
            conversation_id: text("conversationId")?,
            reader_id: text("readerId").or_else(|_| text("userId"))?,
            message_id: text("messageId").ok(),
        }),
        PushEventKind::UserOnline => Ok(PushEvent::UserOnline {
            user_id: text("userId")?,
        }),
        PushEventKind::UserOffline => Ok(PushEvent::UserOffline {
            user_id: text("userId")?,
        }),
        PushEventKind::GroupDeleted => Ok(PushEvent::GroupDeleted {
            conversation_id: text("conversationId").or_else(|_| text("groupId"))?,
        }),
    }
}
