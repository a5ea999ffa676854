//! Conversation and message entities held by the store.

use parley_api::{RemoteConversation, RemoteMessage, Role, Uncertainty, Usage};
use serde::{Deserialize, Serialize};

/// Title given to conversations before their first user message
pub const DEFAULT_TITLE: &str = "New conversation";

/// Titles derived from a first message keep this many characters
pub const TITLE_MAX_CHARS: usize = 50;

/// Prefix of ids allocated locally, before the backend assigns one
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds
    pub timestamp: i64,
    /// Whether the assistant is still writing this message
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<Uncertainty>,
}

impl ChatMessage {
    /// Create a message with a fresh id
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_streaming: false,
            entities: None,
            usage: None,
            uncertainty: None,
        }
    }

    /// Convert a message fetched from the backend
    pub fn from_remote(remote: RemoteMessage) -> Self {
        Self {
            id: remote.id,
            role: remote.role,
            content: remote.content,
            timestamp: remote.created_at,
            is_streaming: false,
            entities: None,
            usage: None,
            uncertainty: None,
        }
    }
}

/// A conversation and its loaded messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub updated_at: i64,
    /// Acknowledged by the backend
    pub synced: bool,
    /// Never written to a persisted snapshot
    pub ephemeral: bool,
    /// Message count reported by the backend list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_hint: Option<u32>,
}

impl Conversation {
    /// Create an unsynced conversation with a fresh local id
    pub fn new_local(ephemeral: bool) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            title: DEFAULT_TITLE.to_string(),
            messages: vec![],
            created_at: now,
            updated_at: now,
            synced: false,
            ephemeral,
            message_count_hint: None,
        }
    }

    /// Materialize a backend list entry; messages stay empty until activation
    pub fn from_remote(remote: &RemoteConversation) -> Self {
        Self {
            id: remote.id.clone(),
            title: remote
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            messages: vec![],
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            synced: true,
            ephemeral: false,
            message_count_hint: Some(remote.message_count),
        }
    }

    /// Never acknowledged by the backend
    pub fn is_local_only(&self) -> bool {
        !self.synced
    }

    /// The message currently being streamed, if any
    pub fn streaming_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    /// Whether a turn is in flight in this conversation
    pub fn is_streaming(&self) -> bool {
        self.streaming_message().is_some()
    }

    /// Whether the message bodies still have to be fetched from the backend
    pub fn needs_messages(&self) -> bool {
        self.synced && self.messages.is_empty() && self.message_count_hint != Some(0)
    }

    /// Lightweight view for list observers
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            updated_at: self.updated_at,
            synced: self.synced,
            ephemeral: self.ephemeral,
            message_count: if self.messages.is_empty() {
                self.message_count_hint.unwrap_or(0) as usize
            } else {
                self.messages.len()
            },
            is_streaming: self.is_streaming(),
        }
    }
}

/// List entry published to conversation list observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
    pub synced: bool,
    pub ephemeral: bool,
    pub message_count: usize,
    pub is_streaming: bool,
}

/// Derive a conversation title from its first user message.
///
/// Returns `None` for blank content. Content longer than
/// [`TITLE_MAX_CHARS`] characters is cut and suffixed with `...`.
pub fn derive_title(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        Some(format!("{}...", head))
    } else {
        Some(head)
    }
}
