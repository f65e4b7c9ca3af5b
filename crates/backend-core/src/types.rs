use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// High-level session lifecycle state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    /// No credentials are established.
    SignedOut,
    /// A login, registration or restore flow is running.
    Authenticating,
    /// Credentials are established and conversation commands are accepted.
    Active,
    /// Renewal was impossible; the frontend must re-authenticate.
    Expired,
}

/// Direct (one-to-one) or group conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Message content kind as reported by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
    /// Any kind this client does not know about yet.
    #[serde(other)]
    Other,
}

/// Preview of the most recent message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    pub sender_id: String,
    /// Milliseconds since Unix epoch.
    pub created_at: i64,
}

/// One row of the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: String,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_archived: bool,
}

impl ConversationSummary {
    /// Timestamp of the last message, if the conversation has one.
    pub fn last_activity_ms(&self) -> Option<i64> {
        self.last_message.as_ref().map(|message| message.created_at)
    }
}

/// Validated `message:received` push payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessageEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    pub created_at: i64,
}

impl IncomingMessageEvent {
    /// Conversation preview derived from this event.
    pub fn to_last_message(&self) -> LastMessage {
        LastMessage {
            id: self.message_id.clone(),
            content: self.content.clone(),
            message_type: self.message_type,
            sender_id: self.sender_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// Access and renewal credentials, always stored and replaced together.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub renewal_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, renewal_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            renewal_token: renewal_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("renewal_token", &"<redacted>")
            .finish()
    }
}

/// Cached profile of the signed-in user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Optimistic conversation mutation kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Archive,
    Unarchive,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Unarchive => "unarchive",
            Self::Delete => "delete",
        }
    }
}

/// Command channel input accepted by the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendCommand {
    /// Login with email and password.
    Login { email: String, password: String },
    /// Create an account and sign in.
    Register {
        username: String,
        email: String,
        password: String,
    },
    /// Resume from persisted credentials and profile.
    RestoreSession,
    /// Fetch one snapshot page and merge it into the conversation list.
    LoadSnapshot { limit: u32, offset: u32 },
    /// Re-fetch the first snapshot page.
    Refresh,
    /// Mark a conversation as open (or close the open one with `None`).
    SelectConversation { conversation_id: Option<String> },
    Archive { conversation_id: String },
    Unarchive { conversation_id: String },
    Delete { conversation_id: String },
    /// Logout and clear persisted credentials and conversation state.
    Logout,
}

impl BackendCommand {
    /// Short command label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Register { .. } => "register",
            Self::RestoreSession => "restore_session",
            Self::LoadSnapshot { .. } => "load_snapshot",
            Self::Refresh => "refresh",
            Self::SelectConversation { .. } => "select_conversation",
            Self::Archive { .. } => "archive",
            Self::Unarchive { .. } => "unarchive",
            Self::Delete { .. } => "delete",
            Self::Logout => "logout",
        }
    }
}

/// Outcome of an optimistic archive/unarchive/delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationAck {
    pub conversation_id: String,
    pub kind: MutationKind,
    pub success: bool,
    /// Failure details; the local change has already been rolled back.
    pub error: Option<BackendError>,
}

/// Event channel output emitted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendEvent {
    /// Session lifecycle transition.
    StateChanged { state: SessionState },
    /// Result of a login, registration or restore flow.
    AuthResult {
        success: bool,
        error_code: Option<String>,
    },
    /// Current conversation view after any merge.
    ConversationsUpdated {
        /// Non-archived conversations, most recent activity first.
        active: Vec<ConversationSummary>,
        /// Archived conversations, most recent activity first.
        archived: Vec<ConversationSummary>,
    },
    MutationAck(MutationAck),
    /// A user went online or offline.
    PresenceChanged { user_id: String, online: bool },
    /// Push channel connectivity.
    PushStatus {
        connected: bool,
        /// Delay before the next reconnect attempt, when disconnected.
        retry_in_ms: Option<u64>,
    },
    /// Renewal was impossible; the frontend must force re-authentication.
    SessionExpired,
    /// Transient, retryable failure surfaced to the user.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl BackendEvent {
    /// Short event label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::AuthResult { .. } => "auth_result",
            Self::ConversationsUpdated { .. } => "conversations_updated",
            Self::MutationAck(_) => "mutation_ack",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::PushStatus { .. } => "push_status",
            Self::SessionExpired => "session_expired",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_server_conversation_summary() {
        let raw = r#"{
            "id": "c1",
            "kind": "GROUP",
            "displayName": "Team",
            "lastMessage": {
                "id": "m9",
                "content": "hi",
                "type": "sticker",
                "senderId": "u2",
                "createdAt": 1700000000000
            },
            "unreadCount": 3
        }"#;

        let summary: ConversationSummary =
            serde_json::from_str(raw).expect("summary should decode");
        assert_eq!(summary.kind, ConversationKind::Group);
        assert_eq!(summary.unread_count, 3);
        assert!(!summary.is_archived);
        assert!(!summary.is_favorite);
        let last = summary.last_message.expect("last message should be present");
        assert_eq!(last.message_type, MessageType::Other);
        assert_eq!(last.created_at, 1_700_000_000_000);
    }

    #[test]
    fn credential_debug_output_is_redacted() {
        let pair = CredentialPair::new("access-secret", "renewal-secret");
        let printed = format!("{pair:?}");
        assert!(!printed.contains("access-secret"));
        assert!(!printed.contains("renewal-secret"));
    }

    #[test]
    fn credential_pair_uses_server_field_names() {
        let pair: CredentialPair =
            serde_json::from_str(r#"{"accessToken":"a","refreshToken":"r"}"#)
                .expect("pair should decode");
        assert_eq!(pair, CredentialPair::new("a", "r"));
    }
}
