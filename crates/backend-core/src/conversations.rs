use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{ConversationSummary, IncomingMessageEvent, MutationKind};

/// Number of delivered message ids remembered for duplicate suppression.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 4_096;

/// Errors that can occur while starting an optimistic mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("conversation '{0}' is not known")]
    UnknownConversation(String),
    #[error("conversation '{conversation_id}' already has a pending {kind:?}")]
    MutationPending {
        conversation_id: String,
        kind: MutationKind,
    },
    #[error("conversation '{conversation_id}' is already in the state {kind:?} would produce")]
    NoChange {
        conversation_id: String,
        kind: MutationKind,
    },
}

/// What happened to an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Folded into its conversation, which moved to the front.
    Applied { unread_incremented: bool },
    /// The message id was already delivered.
    Duplicate,
    /// No local entry; the caller should reload the snapshot.
    UnknownConversation,
    /// Malformed event (no conversation id).
    Dropped,
}

/// Read-only view filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationFilter {
    All,
    Unread,
    Favorites,
    Archived,
    /// Case-insensitive match on display name or last message content.
    Search(String),
}

impl ConversationFilter {
    pub fn matches(&self, summary: &ConversationSummary) -> bool {
        match self {
            Self::All => true,
            Self::Unread => summary.unread_count > 0,
            Self::Favorites => summary.is_favorite,
            Self::Archived => summary.is_archived,
            Self::Search(query) => {
                let needle = query.trim().to_lowercase();
                if needle.is_empty() {
                    return true;
                }
                summary.display_name.to_lowercase().contains(&needle)
                    || summary
                        .last_message
                        .as_ref()
                        .is_some_and(|message| message.content.to_lowercase().contains(&needle))
            }
        }
    }

    /// Filter an already-ordered view without reordering it.
    pub fn apply(&self, view: &[ConversationSummary]) -> Vec<ConversationSummary> {
        view.iter()
            .filter(|summary| self.matches(summary))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct PendingMutation {
    kind: MutationKind,
    prior: ConversationSummary,
    prior_index: usize,
}

/// Client-side conversation list merged from snapshots and push events.
///
/// `entries` holds one summary per known conversation id in display order:
/// most recent activity first, with message-less conversations pinned to the
/// slot the snapshot gave them.
#[derive(Debug, Clone)]
pub struct ConversationList {
    entries: Vec<ConversationSummary>,
    pending: HashMap<String, PendingMutation>,
    selected: Option<String>,
    current_user_id: Option<String>,
    seen_messages: HashSet<String>,
    seen_order: VecDeque<String>,
    dedupe_capacity: usize,
    online_users: HashSet<String>,
}

impl Default for ConversationList {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_CAPACITY)
    }
}

impl ConversationList {
    /// Create an empty list remembering up to `dedupe_capacity` message ids (`>= 1`).
    pub fn new(dedupe_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            pending: HashMap::new(),
            selected: None,
            current_user_id: None,
            seen_messages: HashSet::new(),
            seen_order: VecDeque::new(),
            dedupe_capacity: dedupe_capacity.max(1),
            online_users: HashSet::new(),
        }
    }

    pub fn set_current_user(&mut self, user_id: Option<String>) {
        self.current_user_id = user_id;
    }

    pub fn current_user_id(&self) -> Option<&str> {
        self.current_user_id.as_deref()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Every visible conversation (archived included) in display order.
    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.entries.iter().find(|entry| entry.id == conversation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Non-archived conversations in display order.
    pub fn active_view(&self) -> Vec<ConversationSummary> {
        self.filter(|entry| !entry.is_archived)
    }

    /// Archived conversations in display order.
    pub fn archived_view(&self) -> Vec<ConversationSummary> {
        self.filter(|entry| entry.is_archived)
    }

    /// Pure derivation over the ordered entries; never mutates the list.
    pub fn filter<F>(&self, predicate: F) -> Vec<ConversationSummary>
    where
        F: Fn(&ConversationSummary) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    pub fn pending_mutation(&self, conversation_id: &str) -> Option<MutationKind> {
        self.pending.get(conversation_id).map(|pending| pending.kind)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online_users.contains(user_id)
    }

    /// Replace the known set with a snapshot.
    ///
    /// Pending optimistic mutations are re-applied on top of the snapshot, and a
    /// local entry whose last message is newer than the snapshot's keeps its
    /// last message and unread count.
    pub fn load_snapshot(&mut self, snapshot: Vec<ConversationSummary>) {
        let mut merged = Vec::with_capacity(snapshot.len());
        let mut seen_ids = HashSet::new();

        for incoming in snapshot {
            if !seen_ids.insert(incoming.id.clone()) {
                trace!(conversation_id = %incoming.id, "dropping duplicate snapshot entry");
                continue;
            }
            if let Some(entry) = self.reconcile_snapshot_entry(incoming) {
                merged.push(entry);
            }
        }

        self.entries = merged;
        sort_by_recency(&mut self.entries);
        debug!(
            conversation_count = self.entries.len(),
            pending = self.pending.len(),
            "conversation snapshot loaded"
        );

        if let Some(selected) = self.selected.clone()
            && self.get(&selected).is_none()
        {
            warn!(conversation_id = %selected, "selected conversation disappeared from snapshot");
            self.selected = None;
        }
    }

    /// Merge a later snapshot page without dropping conversations outside it.
    pub fn merge_page(&mut self, page: Vec<ConversationSummary>) {
        for incoming in page {
            let Some(entry) = self.reconcile_snapshot_entry(incoming) else {
                continue;
            };
            match self.position(&entry.id) {
                Some(index) => self.entries[index] = entry,
                None => self.entries.push(entry),
            }
        }
        sort_by_recency(&mut self.entries);
        debug!(conversation_count = self.entries.len(), "conversation page merged");
    }

    /// Fold a push message into its conversation and promote it to the front.
    pub fn apply_incoming_message(&mut self, event: &IncomingMessageEvent) -> IncomingOutcome {
        if event.conversation_id.trim().is_empty() {
            warn!(message_id = %event.message_id, "dropping incoming message without conversation id");
            return IncomingOutcome::Dropped;
        }
        if self.seen_messages.contains(&event.message_id) {
            debug!(
                conversation_id = %event.conversation_id,
                message_id = %event.message_id,
                "ignoring duplicate message delivery"
            );
            return IncomingOutcome::Duplicate;
        }

        let selected = self.selected.as_deref();
        let current_user = self.current_user_id.as_deref();

        if let Some(index) = self.position(&event.conversation_id) {
            let mut entry = self.entries.remove(index);
            let unread_incremented = fold_message(&mut entry, event, selected, current_user);
            self.entries.insert(0, entry);
            self.remember_message(&event.message_id);
            return IncomingOutcome::Applied { unread_incremented };
        }

        // Hidden by a pending delete: keep the prior entry current so a rollback
        // restores what the server sent.
        if let Some(pending) = self.pending.get_mut(&event.conversation_id) {
            let unread_incremented =
                fold_message(&mut pending.prior, event, selected, current_user);
            pending.prior_index = 0;
            self.remember_message(&event.message_id);
            return IncomingOutcome::Applied { unread_incremented };
        }

        debug!(conversation_id = %event.conversation_id, "message for unknown conversation");
        IncomingOutcome::UnknownConversation
    }

    /// Mark a conversation as open (resetting its unread count) or close it.
    pub fn select(&mut self, conversation_id: Option<String>) -> bool {
        let changed = self.selected != conversation_id;
        self.selected = conversation_id;

        let mut reset = false;
        if let Some(selected) = self.selected.clone()
            && let Some(entry) = self.entry_mut(&selected)
            && entry.unread_count > 0
        {
            entry.unread_count = 0;
            reset = true;
        }
        changed || reset
    }

    /// Apply a read receipt; only the current user's receipts clear unread counts.
    pub fn apply_read_receipt(&mut self, conversation_id: &str, reader_id: &str) -> bool {
        if self.current_user_id.as_deref() != Some(reader_id) {
            return false;
        }
        match self.entry_mut(conversation_id) {
            Some(entry) if entry.unread_count > 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Remove a conversation the server deleted, dropping any pending mutation.
    pub fn remove_conversation(&mut self, conversation_id: &str) -> Option<ConversationSummary> {
        let pending = self.pending.remove(conversation_id);
        if self.selected.as_deref() == Some(conversation_id) {
            self.selected = None;
        }
        match self.position(conversation_id) {
            Some(index) => Some(self.entries.remove(index)),
            None => pending.map(|pending| pending.prior),
        }
    }

    pub fn set_presence(&mut self, user_id: &str, online: bool) -> bool {
        if online {
            self.online_users.insert(user_id.to_owned())
        } else {
            self.online_users.remove(user_id)
        }
    }

    /// Apply an archive/unarchive/delete locally before the server confirms it.
    pub fn begin_mutation(
        &mut self,
        conversation_id: &str,
        kind: MutationKind,
    ) -> Result<(), ConversationError> {
        if let Some(pending) = self.pending.get(conversation_id) {
            return Err(ConversationError::MutationPending {
                conversation_id: conversation_id.to_owned(),
                kind: pending.kind,
            });
        }

        let index = self
            .position(conversation_id)
            .ok_or_else(|| ConversationError::UnknownConversation(conversation_id.to_owned()))?;
        let prior = self.entries[index].clone();

        let no_change = match kind {
            MutationKind::Archive => prior.is_archived,
            MutationKind::Unarchive => !prior.is_archived,
            MutationKind::Delete => false,
        };
        if no_change {
            return Err(ConversationError::NoChange {
                conversation_id: conversation_id.to_owned(),
                kind,
            });
        }

        match kind {
            MutationKind::Archive => self.entries[index].is_archived = true,
            MutationKind::Unarchive => self.entries[index].is_archived = false,
            MutationKind::Delete => {
                self.entries.remove(index);
                if self.selected.as_deref() == Some(conversation_id) {
                    self.selected = None;
                }
            }
        }

        debug!(%conversation_id, kind = kind.as_str(), "optimistic mutation applied");
        self.pending.insert(
            conversation_id.to_owned(),
            PendingMutation {
                kind,
                prior,
                prior_index: index,
            },
        );
        Ok(())
    }

    /// The server accepted the mutation; the local state becomes authoritative.
    pub fn confirm_mutation(&mut self, conversation_id: &str) -> Option<MutationKind> {
        let pending = self.pending.remove(conversation_id)?;
        debug!(%conversation_id, kind = pending.kind.as_str(), "optimistic mutation confirmed");
        Some(pending.kind)
    }

    /// The server rejected the mutation; restore the entry as it was before it.
    ///
    /// A deleted entry goes back to the slot it was taken from (the front, if
    /// a message arrived meanwhile) without re-sorting its neighbours. Best
    /// effort: callers should still re-fetch when exact ordering matters.
    pub fn rollback_mutation(&mut self, conversation_id: &str) -> Option<MutationKind> {
        let pending = self.pending.remove(conversation_id)?;

        match self.position(conversation_id) {
            Some(index) => {
                self.entries[index].is_archived = pending.prior.is_archived;
            }
            None => {
                let index = pending.prior_index.min(self.entries.len());
                self.entries.insert(index, pending.prior);
            }
        }

        warn!(%conversation_id, kind = pending.kind.as_str(), "optimistic mutation rolled back");
        Some(pending.kind)
    }

    /// Forget everything (logout).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.selected = None;
        self.current_user_id = None;
        self.seen_messages.clear();
        self.seen_order.clear();
        self.online_users.clear();
    }

    fn reconcile_snapshot_entry(
        &mut self,
        mut incoming: ConversationSummary,
    ) -> Option<ConversationSummary> {
        if let Some(pending) = self.pending.get(&incoming.id) {
            match pending.kind {
                MutationKind::Delete => return None,
                MutationKind::Archive => incoming.is_archived = true,
                MutationKind::Unarchive => incoming.is_archived = false,
            }
        }

        if let Some(local) = self.get(&incoming.id)
            && local.last_activity_ms() > incoming.last_activity_ms()
        {
            trace!(conversation_id = %incoming.id, "keeping newer local message over snapshot");
            incoming.last_message = local.last_message.clone();
            incoming.unread_count = local.unread_count;
        }

        if self.selected.as_deref() == Some(incoming.id.as_str()) {
            incoming.unread_count = 0;
        }

        if let Some(message_id) = incoming.last_message.as_ref().map(|m| m.id.clone()) {
            self.remember_message(&message_id);
        }
        Some(incoming)
    }

    fn remember_message(&mut self, message_id: &str) {
        if !self.seen_messages.insert(message_id.to_owned()) {
            return;
        }
        self.seen_order.push_back(message_id.to_owned());
        while self.seen_order.len() > self.dedupe_capacity {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen_messages.remove(&evicted);
            }
        }
    }

    fn position(&self, conversation_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.id == conversation_id)
    }

    fn entry_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationSummary> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == conversation_id)
    }
}

fn fold_message(
    entry: &mut ConversationSummary,
    event: &IncomingMessageEvent,
    selected: Option<&str>,
    current_user: Option<&str>,
) -> bool {
    let newer = entry
        .last_activity_ms()
        .is_none_or(|current| event.created_at >= current);
    if newer {
        entry.last_message = Some(event.to_last_message());
    }

    let is_open = selected == Some(event.conversation_id.as_str());
    let is_own = current_user == Some(event.sender_id.as_str());
    if is_open || is_own {
        return false;
    }
    entry.unread_count = entry.unread_count.saturating_add(1);
    true
}

/// Sort dated entries most-recent-first while message-less entries keep their slots.
fn sort_by_recency(entries: &mut [ConversationSummary]) {
    let slots: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.last_message.is_some())
        .map(|(index, _)| index)
        .collect();

    let mut dated: Vec<ConversationSummary> =
        slots.iter().map(|&index| entries[index].clone()).collect();
    dated.sort_by(|a, b| b.last_activity_ms().cmp(&a.last_activity_ms()));

    for (slot, entry) in slots.into_iter().zip(dated) {
        entries[slot] = entry;
    }
}
