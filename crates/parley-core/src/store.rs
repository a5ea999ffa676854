//! The conversation store: single owner of all conversation state.
//!
//! Every mutation is one synchronous transition performed under the store
//! lock, followed by a republish of the observer channels. The lock is never
//! held across an `.await`, so overlapping async flows (a streaming turn, a
//! reconciliation pass, a user deletion) can only interleave between
//! transitions, never inside one.

use parking_lot::Mutex;
use parley_api::{Role, Uncertainty, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::watch;

use crate::conversation::{ChatMessage, Conversation, ConversationSummary, derive_title};
use crate::error::{Error, Result};

/// Default cap on never-synced conversations
pub const DEFAULT_MAX_LOCAL_ONLY: usize = 50;

/// Flags for [`ConversationStore::append_message`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// The message will be filled by a response stream
    pub is_streaming: bool,
}

impl MessageFlags {
    /// Flags for an assistant placeholder awaiting streamed content
    pub fn streaming() -> Self {
        Self { is_streaming: true }
    }
}

/// Ids allocated by [`ConversationStore::begin_turn`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnIds {
    pub conversation_id: String,
    /// Whether the conversation was already known to the backend
    pub synced: bool,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

/// A point-in-time copy of the store contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub conversations: Vec<Conversation>,
    pub current_id: Option<String>,
}

#[derive(Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    current_id: Option<String>,
}

impl StoreState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    fn current(&self) -> Option<&Conversation> {
        let id = self.current_id.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }

    fn current_index(&self) -> Option<usize> {
        self.index_of(self.current_id.as_deref()?)
    }

    /// Index of the current conversation, creating a local one if none is current
    fn ensure_current(&mut self) -> usize {
        if let Some(idx) = self.current_index() {
            return idx;
        }
        let conversation = Conversation::new_local(false);
        self.current_id = Some(conversation.id.clone());
        self.conversations.insert(0, conversation);
        0
    }

    fn push_message(
        &mut self,
        idx: usize,
        role: Role,
        content: String,
        flags: MessageFlags,
    ) -> Result<String> {
        let conversation = &mut self.conversations[idx];
        if flags.is_streaming && conversation.is_streaming() {
            return Err(Error::TurnInProgress);
        }

        if role == Role::User && conversation.messages.is_empty() && !conversation.synced {
            if let Some(title) = derive_title(&content) {
                conversation.title = title;
            }
        }

        let mut message = ChatMessage::new(role, content);
        message.is_streaming = flags.is_streaming;
        let message_id = message.id.clone();
        conversation.updated_at = message.timestamp;
        conversation.messages.push(message);
        Ok(message_id)
    }

    /// Run `f` on the conversation holding `message_id` and the message's index
    fn with_message<R>(
        &mut self,
        message_id: &str,
        f: impl FnOnce(&mut Conversation, usize) -> Result<R>,
    ) -> Result<R> {
        for conversation in &mut self.conversations {
            if let Some(idx) = conversation.messages.iter().position(|m| m.id == message_id) {
                return f(conversation, idx);
            }
        }
        Err(Error::MessageNotFound(message_id.to_string()))
    }

    /// Drop the oldest local-only conversations beyond `cap`.
    ///
    /// The current conversation and conversations with a turn in flight are
    /// never evicted.
    fn evict_local_only(&mut self, cap: usize) -> Vec<String> {
        let local_only = self
            .conversations
            .iter()
            .filter(|c| c.is_local_only())
            .count();
        let mut excess = local_only.saturating_sub(cap);
        let mut evicted = Vec::new();

        let mut idx = self.conversations.len();
        while excess > 0 && idx > 0 {
            idx -= 1;
            let candidate = &self.conversations[idx];
            let protected = candidate.synced
                || self.current_id.as_deref() == Some(candidate.id.as_str())
                || candidate.is_streaming();
            if !protected {
                evicted.push(self.conversations.remove(idx).id);
                excess -= 1;
            }
        }

        for id in &evicted {
            tracing::warn!(
                "Evicted unsynced conversation {} (more than {} local-only conversations)",
                id,
                cap
            );
        }
        evicted
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            current_id: self.current_id.clone(),
        }
    }
}

/// Single source of truth for in-memory conversations and messages
pub struct ConversationStore {
    state: Mutex<StoreState>,
    max_local_only: usize,
    revision_tx: watch::Sender<u64>,
    current_tx: watch::Sender<Option<Conversation>>,
    streaming_tx: watch::Sender<bool>,
    list_tx: watch::Sender<Vec<ConversationSummary>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOCAL_ONLY)
    }
}

impl ConversationStore {
    /// Create an empty store holding at most `max_local_only` unsynced conversations
    pub fn new(max_local_only: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            max_local_only: max_local_only.max(1),
            revision_tx: watch::channel(0).0,
            current_tx: watch::channel(None).0,
            streaming_tx: watch::channel(false).0,
            list_tx: watch::channel(Vec::new()).0,
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Apply an infallible transition and republish
    fn apply<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        let out = f(&mut state);
        self.publish(&state);
        out
    }

    /// Apply a transition; observers are only notified when it succeeds
    fn try_apply<R>(&self, f: impl FnOnce(&mut StoreState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let out = f(&mut state)?;
        self.publish(&state);
        Ok(out)
    }

    fn publish(&self, state: &StoreState) {
        self.revision_tx.send_modify(|rev| *rev += 1);

        let current = state.current().cloned();
        self.current_tx.send_if_modified(|slot| {
            if *slot != current {
                *slot = current;
                true
            } else {
                false
            }
        });

        let streaming = state.conversations.iter().any(|c| c.is_streaming());
        self.streaming_tx.send_if_modified(|slot| {
            let changed = *slot != streaming;
            *slot = streaming;
            changed
        });

        let list: Vec<ConversationSummary> =
            state.conversations.iter().map(|c| c.summary()).collect();
        self.list_tx.send_if_modified(|slot| {
            if *slot != list {
                *slot = list;
                true
            } else {
                false
            }
        });
    }

    /// Create a local conversation at the head of the list and make it current
    pub fn create_conversation(&self, ephemeral: bool) -> String {
        let cap = self.max_local_only;
        self.apply(|state| {
            let conversation = Conversation::new_local(ephemeral);
            let id = conversation.id.clone();
            state.conversations.insert(0, conversation);
            state.current_id = Some(id.clone());
            state.evict_local_only(cap);
            id
        })
    }

    /// Append a message to the current conversation, creating one if needed.
    ///
    /// The first user message of an unsynced conversation names it. A second
    /// streaming message in the same conversation is rejected.
    pub fn append_message(
        &self,
        role: Role,
        content: impl Into<String>,
        flags: MessageFlags,
    ) -> Result<String> {
        let content = content.into();
        let cap = self.max_local_only;
        self.try_apply(|state| {
            let idx = state.ensure_current();
            let message_id = state.push_message(idx, role, content, flags)?;
            state.evict_local_only(cap);
            Ok(message_id)
        })
    }

    /// Open a turn in the current conversation as one transition.
    ///
    /// Appends the user message and an empty streaming assistant placeholder
    /// to the same conversation, creating one if none is current.
    pub fn begin_turn(&self, content: impl Into<String>) -> Result<TurnIds> {
        let content = content.into();
        let cap = self.max_local_only;
        self.try_apply(|state| {
            let idx = state.ensure_current();
            if state.conversations[idx].is_streaming() {
                return Err(Error::TurnInProgress);
            }
            let user_message_id = state.push_message(idx, Role::User, content, MessageFlags::default())?;
            let assistant_message_id =
                state.push_message(idx, Role::Assistant, String::new(), MessageFlags::streaming())?;
            let conversation = &state.conversations[idx];
            let ids = TurnIds {
                conversation_id: conversation.id.clone(),
                synced: conversation.synced,
                user_message_id,
                assistant_message_id,
            };
            state.evict_local_only(cap);
            Ok(ids)
        })
    }

    /// Replace a message's content and end its streaming state
    pub fn update_message_content(&self, message_id: &str, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.try_apply(|state| {
            state.with_message(message_id, |conversation, idx| {
                let message = &mut conversation.messages[idx];
                message.content = content;
                message.is_streaming = false;
                conversation.updated_at = chrono::Utc::now().timestamp_millis();
                Ok(())
            })
        })
    }

    /// Write intermediate content of a message that is still streaming
    pub fn set_streaming_content(&self, message_id: &str, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.try_apply(|state| {
            state.with_message(message_id, |conversation, idx| {
                let message = &mut conversation.messages[idx];
                if !message.is_streaming {
                    return Err(Error::NotStreaming(message_id.to_string()));
                }
                message.content = content;
                Ok(())
            })
        })
    }

    /// Merge usage and uncertainty into a message; absent values are left alone
    pub fn attach_metadata(
        &self,
        message_id: &str,
        usage: Option<Usage>,
        uncertainty: Option<Uncertainty>,
    ) -> Result<()> {
        self.try_apply(|state| {
            state.with_message(message_id, |conversation, idx| {
                let message = &mut conversation.messages[idx];
                if let Some(usage) = usage {
                    message.usage = Some(usage);
                }
                if let Some(uncertainty) = uncertainty {
                    message.uncertainty = Some(uncertainty);
                }
                Ok(())
            })
        })
    }

    /// Record entities detected for a message
    pub fn attach_entities(&self, message_id: &str, entities: serde_json::Value) -> Result<()> {
        self.try_apply(|state| {
            state.with_message(message_id, |conversation, idx| {
                conversation.messages[idx].entities = Some(entities);
                Ok(())
            })
        })
    }

    /// Swap a provisional conversation id for the backend's id.
    ///
    /// Marks the conversation synced and repoints the current pointer in the
    /// same step. If the backend id is already held (a reconciliation pass
    /// materialized it first), that shadow entry is dropped in favor of the
    /// local conversation.
    pub fn remap_conversation_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        self.try_apply(|state| {
            let mut idx = state
                .index_of(old_id)
                .ok_or_else(|| Error::ConversationNotFound(old_id.to_string()))?;

            if old_id != new_id {
                if let Some(dup) = state.index_of(new_id) {
                    let shadow = state.conversations.remove(dup);
                    if dup < idx {
                        idx -= 1;
                    }
                    let conversation = &mut state.conversations[idx];
                    if conversation.messages.is_empty() {
                        conversation.messages = shadow.messages;
                    }
                    tracing::debug!("Remap of {} replaced existing entry {}", old_id, new_id);
                }
            }

            let conversation = &mut state.conversations[idx];
            conversation.id = new_id.to_string();
            conversation.synced = true;

            if state.current_id.as_deref() == Some(old_id) {
                state.current_id = Some(new_id.to_string());
            }
            Ok(())
        })
    }

    /// Remove a conversation.
    ///
    /// If it was current, the conversation that followed it (or else the one
    /// before it) becomes current.
    pub fn delete_conversation(&self, id: &str) -> Option<Conversation> {
        let mut state = self.state.lock();
        let idx = state.index_of(id)?;
        let removed = state.conversations.remove(idx);

        if state.current_id.as_deref() == Some(id) {
            let next = state
                .conversations
                .get(idx)
                .or_else(|| idx.checked_sub(1).and_then(|i| state.conversations.get(i)))
                .map(|c| c.id.clone());
            state.current_id = next;
        }
        self.publish(&state);
        Some(removed)
    }

    /// Make a conversation current
    pub fn set_current(&self, id: &str) -> Result<()> {
        self.try_apply(|state| {
            if state.index_of(id).is_none() {
                return Err(Error::ConversationNotFound(id.to_string()));
            }
            state.current_id = Some(id.to_string());
            Ok(())
        })
    }

    /// Leave no conversation current; the next message starts a new one
    pub fn clear_current(&self) {
        self.apply(|state| state.current_id = None);
    }

    /// Merge a backend page into the store.
    ///
    /// Backend conversations come first, in page order. A backend entry that
    /// is already held with loaded messages keeps them. Conversations missing
    /// from the page survive only if they are local-only or have a turn in
    /// flight, and keep their relative order after the backend entries.
    pub fn merge_remote(&self, remote: Vec<Conversation>) -> usize {
        self.apply(|state| {
            let mut seen = HashSet::new();
            let mut merged = Vec::with_capacity(remote.len() + state.conversations.len());

            for mut incoming in remote {
                if !seen.insert(incoming.id.clone()) {
                    continue;
                }
                if let Some(existing) = state.conversations.iter().find(|c| c.id == incoming.id) {
                    if !existing.messages.is_empty() {
                        incoming.messages = existing.messages.clone();
                    }
                    incoming.ephemeral = existing.ephemeral;
                }
                merged.push(incoming);
            }
            let from_backend = merged.len();

            merged.extend(
                state
                    .conversations
                    .iter()
                    .filter(|c| !seen.contains(&c.id) && (c.is_local_only() || c.is_streaming()))
                    .cloned(),
            );

            state.conversations = merged;
            if state.current_index().is_none() {
                state.current_id = None;
            }
            from_backend
        })
    }

    /// Install fetched messages into a synced conversation that has none.
    ///
    /// Returns `false` (and changes nothing) if the conversation is gone, is
    /// not synced, or gained messages in the meantime.
    pub fn install_messages(&self, id: &str, messages: Vec<ChatMessage>) -> bool {
        let mut state = self.state.lock();
        let Some(idx) = state.index_of(id) else {
            return false;
        };
        let conversation = &mut state.conversations[idx];
        if !conversation.synced || !conversation.messages.is_empty() {
            return false;
        }
        conversation.message_count_hint = Some(messages.len() as u32);
        conversation.messages = messages;
        self.publish(&state);
        true
    }

    /// Replace the store contents with a restored snapshot.
    ///
    /// Duplicate ids keep their first occurrence, and no restored message is
    /// left streaming.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.apply(|state| {
            let mut seen = HashSet::new();
            state.conversations = snapshot
                .conversations
                .into_iter()
                .filter(|c| seen.insert(c.id.clone()))
                .map(|mut c| {
                    for message in &mut c.messages {
                        message.is_streaming = false;
                    }
                    c
                })
                .collect();
            state.current_id = snapshot.current_id;
            if state.current_index().is_none() {
                state.current_id = None;
            }
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Copy the full store contents
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().snapshot()
    }

    /// Id of the current conversation
    pub fn current_id(&self) -> Option<String> {
        self.state.lock().current_id.clone()
    }

    /// Copy of the current conversation
    pub fn current(&self) -> Option<Conversation> {
        self.state.lock().current().cloned()
    }

    /// Copy of a conversation by id
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        let state = self.state.lock();
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    /// Id of the conversation currently holding a message
    pub fn conversation_of(&self, message_id: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .find(|c| c.messages.iter().any(|m| m.id == message_id))
            .map(|c| c.id.clone())
    }

    /// Copy of a message by id
    pub fn message(&self, message_id: &str) -> Option<ChatMessage> {
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .flat_map(|c| c.messages.iter())
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// Summaries of all conversations in list order
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.state.lock();
        state.conversations.iter().map(|c| c.summary()).collect()
    }

    /// Number of conversations held
    pub fn len(&self) -> usize {
        self.state.lock().conversations.len()
    }

    /// Whether the store holds no conversation
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any message is streaming
    pub fn is_streaming(&self) -> bool {
        *self.streaming_tx.borrow()
    }

    /// Number of transitions applied so far
    pub fn revision(&self) -> u64 {
        *self.revision_tx.borrow()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Observe the transition counter
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Observe the current conversation
    pub fn subscribe_current(&self) -> watch::Receiver<Option<Conversation>> {
        self.current_tx.subscribe()
    }

    /// Observe whether a response is streaming
    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.streaming_tx.subscribe()
    }

    /// Observe the conversation list
    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.list_tx.subscribe()
    }
}
