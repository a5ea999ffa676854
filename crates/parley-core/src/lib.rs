//! parley-core: conversation state and streaming turns
//!
//! This crate provides:
//! - The [`ConversationStore`], the single owner of conversation state
//! - Frame-paced coalescing of streamed message content
//! - Reconciliation of local conversations with the backend
//! - Filtered snapshots that never persist ephemeral conversations
//! - The [`ChatEngine`] tying these together for a front end

pub mod coalesce;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod persist;
pub mod reconcile;
pub mod store;

#[cfg(test)]
mod mock;

pub use coalesce::{FrameHandle, FrameScheduler, IntervalFrames, ManualFrames, RenderCoalescer};
pub use conversation::{ChatMessage, Conversation, ConversationSummary, derive_title};
pub use engine::{ChatEngine, EngineConfig};
pub use error::{Error, Result};
pub use events::{EngineEvent, TurnOutcome};
pub use handle::TurnHandle;
pub use persist::{PersistenceGate, spawn_autosave};
pub use reconcile::SyncReconciler;
pub use store::{ConversationStore, MessageFlags, StoreSnapshot, TurnIds};

// Re-export the backend contract for convenience
pub use parley_api;
