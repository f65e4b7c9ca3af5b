//! Core contract of the chat backend, free of I/O.
//!
//! This crate defines the command/event protocol, the session lifecycle, the
//! normalized transport result, the typed push event set and the conversation
//! reconciliation engine that merges snapshots with push deliveries.

/// Push channel reconnect backoff.
pub mod backoff;
/// Async command/event channel primitives.
pub mod channel;
/// Conversation list reconciliation (snapshots, push messages, optimistic mutations).
pub mod conversations;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// Normalized transport results and mutation acknowledgements.
pub mod normalization;
/// Typed push events and frame validation.
pub mod push;
/// Session lifecycle state machine.
pub mod state_machine;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;

pub use backoff::ReconnectBackoff;
pub use channel::{BackendChannelError, BackendChannels, EventStream};
pub use conversations::{
    ConversationError, ConversationFilter, ConversationList, DEFAULT_DEDUPE_CAPACITY,
    IncomingOutcome,
};
pub use error::{
    AUTH_ERROR, BackendError, BackendErrorCategory, NETWORK_ERROR, UNKNOWN_ERROR,
    VALIDATION_ERROR, classify_http_status,
};
pub use normalization::{
    ApiErrorBody, ApiResponse, normalize_error_event, normalize_failure_response,
    normalize_mutation_outcome, unwrap_success_envelope,
};
pub use push::{PushDecodeError, PushEvent, PushEventKind, decode_frame};
pub use state_machine::SessionStateMachine;
pub use types::{
    BackendCommand, BackendEvent, ConversationKind, ConversationSummary, CredentialPair,
    IncomingMessageEvent, LastMessage, MessageType, MutationAck, MutationKind, SessionState,
    UserProfile,
};
