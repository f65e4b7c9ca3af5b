//! Serialized backend runtime.
//!
//! One task owns the conversation engine and the session state machine. UI
//! commands, decoded push events, push connectivity and the completions of
//! spawned network calls are all applied by that task in receipt order.

use std::{sync::Arc, time::Duration};

use backend_core::{
    BackendChannelError, BackendChannels, BackendCommand, BackendError, BackendErrorCategory,
    BackendEvent, ConversationError, ConversationList, ConversationSummary,
    DEFAULT_DEDUPE_CAPACITY, EventStream, IncomingOutcome, MutationKind, PushEvent, PushEventKind,
    ReconnectBackoff, SessionStateMachine, normalize_error_event,
    normalize_mutation_outcome,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    api::ConversationService,
    config::ClientConfig,
    push::{EventBus, PushConnection, PushLinkState},
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Tunables of the runtime task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub snapshot_page_size: u32,
    /// Push channel URL; `None` leaves push delivery to [`RuntimeHandle::event_bus`].
    pub push_url: Option<Url>,
    pub push_reconnect_base: Duration,
    pub push_reconnect_max: Duration,
    pub dedupe_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            snapshot_page_size: 50,
            push_url: None,
            push_reconnect_base: Duration::from_millis(500),
            push_reconnect_max: Duration::from_secs(30),
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            snapshot_page_size: config.snapshot_page_size,
            push_url: Some(config.push_url.clone()),
            push_reconnect_base: config.push_reconnect_base,
            push_reconnect_max: config.push_reconnect_max,
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
        }
    }
}

/// Frontend handle to a running runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    channels: BackendChannels,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl RuntimeHandle {
    pub async fn send(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Bus feeding push events into the runtime. Frames dispatched here are
    /// handled exactly like frames from the websocket connection.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Stop the runtime task and its push connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Spawn the runtime task on the current tokio runtime.
pub fn spawn_runtime(service: Arc<dyn ConversationService>, options: RuntimeOptions) -> RuntimeHandle {
    let (channels, command_rx) = BackendChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let bus = EventBus::new();
    for kind in PushEventKind::ALL {
        let inbound_tx = inbound_tx.clone();
        bus.subscribe(kind, move |event| {
            let _ = inbound_tx.send(Inbound::Push(event.clone()));
        });
    }

    let shutdown = CancellationToken::new();
    let conversations = ConversationList::new(options.dedupe_capacity);
    let runtime = ChatRuntime {
        channels: channels.clone(),
        command_rx,
        inbound_tx,
        inbound_rx,
        link_tx,
        link_rx,
        expired_rx: service.subscribe_expired(),
        service,
        options,
        bus: bus.clone(),
        state_machine: SessionStateMachine::default(),
        conversations,
        generation: 0,
        reload_in_flight: false,
        reload_again: false,
        push_stop: None,
        shutdown: shutdown.clone(),
    };
    tokio::spawn(async move {
        runtime.run().await;
    });

    RuntimeHandle {
        channels,
        bus,
        shutdown,
    }
}

/// Why a snapshot page was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotOrigin {
    Command,
    Reload,
}

/// Work items entering the runtime queue besides UI commands.
#[derive(Debug)]
enum Inbound {
    Push(PushEvent),
    AuthFinished {
        generation: u64,
        result: Result<(), BackendError>,
    },
    SnapshotFetched {
        generation: u64,
        offset: u32,
        origin: SnapshotOrigin,
        result: Result<Vec<ConversationSummary>, BackendError>,
    },
    MutationFinished {
        generation: u64,
        conversation_id: String,
        kind: MutationKind,
        result: Result<(), BackendError>,
    },
}

struct ChatRuntime {
    channels: BackendChannels,
    command_rx: mpsc::Receiver<BackendCommand>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    link_tx: mpsc::UnboundedSender<PushLinkState>,
    link_rx: mpsc::UnboundedReceiver<PushLinkState>,
    expired_rx: watch::Receiver<bool>,
    service: Arc<dyn ConversationService>,
    options: RuntimeOptions,
    bus: EventBus,
    state_machine: SessionStateMachine,
    conversations: ConversationList,
    /// Bumped whenever the session ends, so late completions are discarded.
    generation: u64,
    reload_in_flight: bool,
    reload_again: bool,
    push_stop: Option<CancellationToken>,
    shutdown: CancellationToken,
}

impl ChatRuntime {
    async fn run(mut self) {
        let mut watch_expiry = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound),
                Some(link) = self.link_rx.recv() => self.handle_push_link(link),
                changed = self.expired_rx.changed(), if watch_expiry => {
                    if changed.is_err() {
                        watch_expiry = false;
                    } else if *self.expired_rx.borrow_and_update() {
                        self.handle_session_expired();
                    }
                }
            }
        }

        self.stop_push();
        debug!("runtime stopped");
    }

    fn handle_command(&mut self, command: BackendCommand) {
        debug!(command = command.kind(), "runtime command");

        let transition = self.state_machine.apply(&command);
        let events = match transition {
            Ok(events) => events,
            Err(err) => {
                if matches!(
                    command,
                    BackendCommand::Login { .. }
                        | BackendCommand::Register { .. }
                        | BackendCommand::RestoreSession
                ) {
                    self.emit_auth_result(Some(&err));
                } else {
                    self.emit_error(err);
                }
                return;
            }
        };
        for event in events {
            self.channels.emit(event);
        }

        match command {
            BackendCommand::Login { email, password } => {
                let since = self.service.session_epoch();
                self.spawn_auth(move |service| async move {
                    service.login(&email, &password, since).await.map(|_| ())
                });
            }
            BackendCommand::Register {
                username,
                email,
                password,
            } => {
                let since = self.service.session_epoch();
                self.spawn_auth(move |service| async move {
                    service
                        .register(&username, &email, &password, since)
                        .await
                        .map(|_| ())
                });
            }
            BackendCommand::RestoreSession => {
                let since = self.service.session_epoch();
                self.spawn_auth(move |service| async move {
                    if service.restore(since).await? {
                        Ok(())
                    } else {
                        Err(BackendError::new(
                            BackendErrorCategory::Auth,
                            "no_stored_session",
                            "no persisted session to restore",
                        ))
                    }
                });
            }
            BackendCommand::LoadSnapshot { limit, offset } => {
                self.spawn_snapshot(limit, offset, SnapshotOrigin::Command);
            }
            BackendCommand::Refresh => self.request_reload(),
            BackendCommand::SelectConversation { conversation_id } => {
                if self.conversations.select(conversation_id) {
                    self.publish_conversations();
                }
            }
            BackendCommand::Archive { conversation_id } => {
                self.begin_mutation(conversation_id, MutationKind::Archive);
            }
            BackendCommand::Unarchive { conversation_id } => {
                self.begin_mutation(conversation_id, MutationKind::Unarchive);
            }
            BackendCommand::Delete { conversation_id } => {
                self.begin_mutation(conversation_id, MutationKind::Delete);
            }
            BackendCommand::Logout => self.handle_logout(),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Push(event) => self.handle_push_event(event),
            Inbound::AuthFinished { generation, result } => {
                if generation == self.generation {
                    self.finish_auth(result);
                }
            }
            Inbound::SnapshotFetched {
                generation,
                offset,
                origin,
                result,
            } => {
                if generation == self.generation {
                    self.finish_snapshot(offset, origin, result);
                }
            }
            Inbound::MutationFinished {
                generation,
                conversation_id,
                kind,
                result,
            } => {
                if generation == self.generation {
                    self.finish_mutation(conversation_id, kind, result);
                }
            }
        }
    }

    fn spawn_auth<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn ConversationService>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let inbound_tx = self.inbound_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = call(service).await;
            let _ = inbound_tx.send(Inbound::AuthFinished { generation, result });
        });
    }

    fn finish_auth(&mut self, result: Result<(), BackendError>) {
        match self.state_machine.on_auth_result(result.is_ok()) {
            Ok(event) => self.channels.emit(event),
            Err(err) => {
                warn!(error = %err, "auth completion arrived in unexpected state");
                return;
            }
        }
        self.emit_auth_result(result.as_ref().err());

        if result.is_ok() {
            let user_id = self.service.current_user_id();
            info!(user_id = user_id.as_deref().unwrap_or("unknown"), "session active");
            self.conversations.set_current_user(user_id);
            self.start_push();
            self.spawn_snapshot(self.options.snapshot_page_size, 0, SnapshotOrigin::Command);
        }
    }

    fn spawn_snapshot(&mut self, limit: u32, offset: u32, origin: SnapshotOrigin) {
        if origin == SnapshotOrigin::Reload {
            self.reload_in_flight = true;
        }
        let service = Arc::clone(&self.service);
        let inbound_tx = self.inbound_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = service.fetch_snapshot(limit, offset).await;
            let _ = inbound_tx.send(Inbound::SnapshotFetched {
                generation,
                offset,
                origin,
                result,
            });
        });
    }

    /// Reload the first snapshot page, coalescing requests made while one is in flight.
    fn request_reload(&mut self) {
        if self.reload_in_flight {
            self.reload_again = true;
            debug!("snapshot reload already in flight; follow-up scheduled");
            return;
        }
        self.spawn_snapshot(self.options.snapshot_page_size, 0, SnapshotOrigin::Reload);
    }

    fn finish_snapshot(
        &mut self,
        offset: u32,
        origin: SnapshotOrigin,
        result: Result<Vec<ConversationSummary>, BackendError>,
    ) {
        if origin == SnapshotOrigin::Reload {
            self.reload_in_flight = false;
        }

        match result {
            Ok(page) => {
                if offset == 0 {
                    self.conversations.load_snapshot(page);
                } else {
                    self.conversations.merge_page(page);
                }
                self.publish_conversations();
            }
            Err(err) => self.emit_error(err),
        }

        if origin == SnapshotOrigin::Reload && self.reload_again && self.state_machine.is_active() {
            self.reload_again = false;
            self.request_reload();
        }
    }

    fn begin_mutation(&mut self, conversation_id: String, kind: MutationKind) {
        if let Err(err) = self.conversations.begin_mutation(&conversation_id, kind) {
            let error = conversation_error(err);
            self.channels.emit(normalize_mutation_outcome(
                conversation_id,
                kind,
                Err(error),
            ));
            return;
        }
        self.publish_conversations();

        let service = Arc::clone(&self.service);
        let inbound_tx = self.inbound_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = service.mutate(&conversation_id, kind).await;
            let _ = inbound_tx.send(Inbound::MutationFinished {
                generation,
                conversation_id,
                kind,
                result,
            });
        });
    }

    fn finish_mutation(
        &mut self,
        conversation_id: String,
        kind: MutationKind,
        result: Result<(), BackendError>,
    ) {
        match &result {
            Ok(()) => {
                self.conversations.confirm_mutation(&conversation_id);
            }
            Err(err) => {
                warn!(%conversation_id, kind = kind.as_str(), code = %err.code, "mutation failed");
                if self.conversations.rollback_mutation(&conversation_id).is_some() {
                    self.publish_conversations();
                }
                if err.category != BackendErrorCategory::Network && !err.is_auth() {
                    self.request_reload();
                }
            }
        }
        self.channels
            .emit(normalize_mutation_outcome(conversation_id, kind, result));
    }

    fn handle_push_event(&mut self, event: PushEvent) {
        if !self.state_machine.is_active() {
            debug!(kind = %event.kind(), "ignoring push event outside an active session");
            return;
        }

        match event {
            PushEvent::MessageReceived(message) => {
                match self.conversations.apply_incoming_message(&message) {
                    IncomingOutcome::Applied { .. } => self.publish_conversations(),
                    IncomingOutcome::UnknownConversation => self.request_reload(),
                    IncomingOutcome::Duplicate | IncomingOutcome::Dropped => {}
                }
            }
            PushEvent::MessageRead {
                conversation_id,
                reader_id,
                ..
            } => {
                if self
                    .conversations
                    .apply_read_receipt(&conversation_id, &reader_id)
                {
                    self.publish_conversations();
                }
            }
            PushEvent::UserOnline { user_id } => self.set_presence(user_id, true),
            PushEvent::UserOffline { user_id } => self.set_presence(user_id, false),
            PushEvent::GroupDeleted { conversation_id } => {
                if self
                    .conversations
                    .remove_conversation(&conversation_id)
                    .is_some()
                {
                    info!(%conversation_id, "conversation deleted by server");
                    self.publish_conversations();
                }
            }
        }
    }

    fn set_presence(&mut self, user_id: String, online: bool) {
        if self.conversations.set_presence(&user_id, online) {
            self.channels
                .emit(BackendEvent::PresenceChanged { user_id, online });
        }
    }

    fn handle_push_link(&mut self, link: PushLinkState) {
        self.channels.emit(BackendEvent::PushStatus {
            connected: link.connected,
            retry_in_ms: link.retry_in.map(|delay| delay.as_millis() as u64),
        });
    }

    fn handle_session_expired(&mut self) {
        let Some(event) = self.state_machine.on_session_expired() else {
            debug!(state = ?self.state_machine.state(), "expiry signal outside an active session");
            return;
        };
        error!("session expired; re-authentication required");
        self.discard_session();
        self.channels.emit(event);
        self.channels.emit(BackendEvent::SessionExpired);
        self.publish_conversations();
    }

    /// Local sign-out happens before any other queued work runs; only the
    /// server-side revocation is left to a background task.
    fn handle_logout(&mut self) {
        self.discard_session();
        let revoke = match self.service.end_session() {
            Ok(access_token) => access_token,
            Err(err) => {
                self.emit_error(err);
                None
            }
        };
        self.publish_conversations();

        if let Some(access_token) = revoke {
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                if let Err(err) = service.revoke(access_token).await {
                    warn!(code = %err.code, "server logout failed; local session already cleared");
                }
            });
        }
    }

    fn discard_session(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.stop_push();
        self.conversations.clear();
        self.reload_in_flight = false;
        self.reload_again = false;
    }

    fn start_push(&mut self) {
        let Some(url) = self.options.push_url.clone() else {
            return;
        };
        self.stop_push();

        let stop = self.shutdown.child_token();
        PushConnection::new(
            url,
            Arc::clone(&self.service),
            self.bus.clone(),
            ReconnectBackoff::new(self.options.push_reconnect_base, self.options.push_reconnect_max),
            self.link_tx.clone(),
        )
        .spawn(stop.clone());
        self.push_stop = Some(stop);
    }

    fn stop_push(&mut self) {
        if let Some(stop) = self.push_stop.take() {
            stop.cancel();
        }
    }

    fn publish_conversations(&self) {
        self.channels.emit(BackendEvent::ConversationsUpdated {
            active: self.conversations.active_view(),
            archived: self.conversations.archived_view(),
        });
    }

    fn emit_auth_result(&self, error: Option<&BackendError>) {
        self.channels.emit(BackendEvent::AuthResult {
            success: error.is_none(),
            error_code: error.map(|err| err.code.clone()),
        });
    }

    fn emit_error(&self, err: BackendError) {
        // Unrecoverable auth failures surface through `SessionExpired` instead.
        if err.is_auth() {
            debug!(code = %err.code, message = %err.message, "auth failure not reported as error event");
            return;
        }
        self.channels.emit(normalize_error_event(err));
    }
}

fn conversation_error(err: ConversationError) -> BackendError {
    let code = match &err {
        ConversationError::UnknownConversation(_) => "conversation_unknown",
        ConversationError::MutationPending { .. } => "mutation_pending",
        ConversationError::NoChange { .. } => "mutation_no_change",
    };
    BackendError::new(BackendErrorCategory::Validation, code, err.to_string())
}
