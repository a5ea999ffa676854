//! Engine event types

use parley_api::Usage;
use serde::{Deserialize, Serialize};

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The backend sent `done`
    Completed,
    /// The backend or the transport failed; carries the text shown to the user
    Failed(String),
    /// The user aborted the turn or the backend cancelled it
    Cancelled,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed)
    }
}

/// Events emitted by the engine for front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A user turn was sent
    TurnStart {
        conversation_id: String,
        message_id: String,
    },

    /// A provisional conversation id was replaced by the backend's
    ConversationRemapped { old_id: String, new_id: String },

    /// Progress note from the backend
    Status { content: String },

    /// A backend tool produced a result
    ToolResult {
        tool_name: Option<String>,
        content: String,
    },

    /// Entities were detected in the turn
    EntitiesDetected {
        message_id: String,
        entities: serde_json::Value,
    },

    /// The assistant message was finalized
    TurnEnd {
        message_id: String,
        outcome: TurnOutcome,
        usage: Option<Usage>,
    },

    /// A reconciliation pass merged a backend page
    SyncCompleted { count: usize },

    /// A reconciliation pass failed; local state was kept
    SyncFailed { message: String },
}

impl EngineEvent {
    /// Check if this event ends a turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::TurnEnd { .. })
    }
}
