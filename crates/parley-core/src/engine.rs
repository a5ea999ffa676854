//! The chat engine: turns, conversation lifecycle and startup sync

use futures::StreamExt;
use parley_api::{Backend, ChatRequest, ChatStream, StreamChunk, Usage};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    coalesce::{DEFAULT_FRAME_INTERVAL, FrameScheduler, IntervalFrames, RenderCoalescer},
    conversation::{Conversation, ConversationSummary},
    error::{Error, Result},
    events::{EngineEvent, TurnOutcome},
    handle::TurnHandle,
    reconcile::{DEFAULT_PAGE_SIZE, SyncReconciler},
    store::{ConversationStore, DEFAULT_MAX_LOCAL_ONLY},
};

/// Body of an aborted message that received no text
pub const CANCELLED_TEXT: &str = "Response cancelled.";

/// Body of a failed message whose error chunk carried no text
pub const UNKNOWN_ERROR_TEXT: &str = "Unknown error";

/// How long a delete waits for an aborted turn to wind down
const DELETE_ABORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Conversations fetched by the startup reconciliation
    pub page_size: u32,
    /// Let the backend use long-term memory when answering
    pub include_memory: bool,
    /// Minimum delay between two visible updates of a streaming message
    pub frame_interval: Duration,
    /// Maximum number of never-synced conversations kept
    pub max_local_only: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            include_memory: true,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            max_local_only: DEFAULT_MAX_LOCAL_ONLY,
        }
    }
}

/// Result of consuming one response stream
struct StreamResult {
    content: String,
    outcome: TurnOutcome,
    usage: Option<Usage>,
}

/// Orchestrates conversations between a front end and the backend.
///
/// All methods take `&self`; share the engine behind an `Arc` to abort a
/// turn from another task while it streams.
pub struct ChatEngine {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    store: Arc<ConversationStore>,
    reconciler: SyncReconciler,
    frames: Arc<dyn FrameScheduler>,
    event_tx: broadcast::Sender<EngineEvent>,
    handle: TurnHandle,
    started: AtomicBool,
}

impl ChatEngine {
    /// Create an engine with an empty store and timer-driven frames
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>) -> Self {
        let store = Arc::new(ConversationStore::new(config.max_local_only));
        let frames: Arc<dyn FrameScheduler> = Arc::new(IntervalFrames::new(config.frame_interval));
        Self::with_parts(config, backend, store, frames)
    }

    /// Create an engine around an existing store and frame source
    pub fn with_parts(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        store: Arc<ConversationStore>,
        frames: Arc<dyn FrameScheduler>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let reconciler = SyncReconciler::new(backend.clone(), store.clone(), config.page_size);
        Self {
            config,
            backend,
            store,
            reconciler,
            frames,
            event_tx,
            handle: TurnHandle::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the frame source
    pub fn with_frames(mut self, frames: Arc<dyn FrameScheduler>) -> Self {
        self.frames = frames;
        self
    }

    /// Get the engine config
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The conversation store behind this engine
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Get a handle for aborting or awaiting the running turn
    pub fn handle(&self) -> TurnHandle {
        self.handle.clone()
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Observe the current conversation
    pub fn subscribe_current(&self) -> watch::Receiver<Option<Conversation>> {
        self.store.subscribe_current()
    }

    /// Observe whether a response is streaming
    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.store.subscribe_streaming()
    }

    /// Observe the conversation list
    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.store.subscribe_conversations()
    }

    /// Whether a turn is running
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Abort the running turn
    pub fn abort(&self) {
        self.handle.abort();
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run the startup reconciliation. Only the first call does anything.
    ///
    /// A failed pass keeps local state and is reported as
    /// [`EngineEvent::SyncFailed`] as well as in the returned error.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::debug!("Engine already started");
            return Ok(());
        }
        match self.reconciler.reconcile().await {
            Ok(count) => self.emit(EngineEvent::SyncCompleted { count }),
            Err(e) => {
                self.emit(EngineEvent::SyncFailed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        }
        if let Some(id) = self.store.current_id() {
            self.load_messages(&id).await;
        }
        Ok(())
    }

    /// Lazily fetch messages; failures are already logged by the reconciler
    async fn load_messages(&self, conversation_id: &str) {
        let _ = self.reconciler.activate(conversation_id).await;
    }

    /// Make a conversation current, fetching its messages on first use
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        self.store.set_current(conversation_id)?;
        self.load_messages(conversation_id).await;
        Ok(())
    }

    /// Start a new local conversation and make it current
    pub fn create_conversation(&self, ephemeral: bool) -> String {
        self.store.create_conversation(ephemeral)
    }

    /// Delete a conversation locally and, if synced, on the backend.
    ///
    /// A turn streaming into the conversation is aborted first. Backend
    /// failures are logged and otherwise ignored.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.is_streaming() {
            self.handle.abort();
            if !self.handle.wait_for_idle_timeout(DELETE_ABORT_TIMEOUT).await {
                tracing::warn!("Turn in {} did not stop before delete", conversation_id);
            }
        }

        let Some(removed) = self.store.delete_conversation(conversation_id) else {
            return Ok(());
        };
        if removed.synced {
            match self.backend.delete_conversation(conversation_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Conversation {} was already gone on backend", conversation_id);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to delete conversation {} on backend: {}",
                        conversation_id,
                        e
                    );
                }
            }
        }

        if let Some(id) = self.store.current_id() {
            self.load_messages(&id).await;
        }
        Ok(())
    }

    /// Register a local-only conversation with the backend
    pub async fn publish_conversation(&self, conversation_id: &str) -> Result<String> {
        let new_id = self.reconciler.publish(conversation_id).await?;
        self.emit(EngineEvent::ConversationRemapped {
            old_id: conversation_id.to_string(),
            new_id: new_id.clone(),
        });
        Ok(new_id)
    }

    /// Send a user message and stream the answer into the current conversation.
    ///
    /// Stream failures are recovered into the assistant message and reported
    /// as the returned [`TurnOutcome`]. Only rejected sends return `Err`.
    pub async fn send_turn(&self, text: &str) -> Result<TurnOutcome> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let Some(cancel) = self.handle.try_begin() else {
            return Err(Error::TurnInProgress);
        };
        let result = self.run_turn(text, cancel).await;
        self.handle.finish();
        result
    }

    async fn run_turn(&self, text: &str, cancel: CancellationToken) -> Result<TurnOutcome> {
        let ids = self.store.begin_turn(text)?;
        tracing::debug!(
            "Turn started in {} (synced: {})",
            ids.conversation_id,
            ids.synced
        );
        self.emit(EngineEvent::TurnStart {
            conversation_id: ids.conversation_id.clone(),
            message_id: ids.user_message_id.clone(),
        });

        let remote_id = ids.synced.then(|| ids.conversation_id.clone());
        let request = ChatRequest::new(text, remote_id).with_memory(self.config.include_memory);
        let coalescer = RenderCoalescer::new(
            self.store.clone(),
            ids.assistant_message_id.clone(),
            self.frames.clone(),
        );
        let pending_remap = (!ids.synced).then(|| ids.conversation_id.clone());

        // closing the stream must not look like an abort of the turn
        let result = match self.backend.stream_chat(&request, cancel.child_token()).await {
            Ok(mut stream) => {
                let result = self
                    .consume(
                        &mut stream,
                        &coalescer,
                        &ids.assistant_message_id,
                        pending_remap,
                        &cancel,
                    )
                    .await;
                stream.close();
                result
            }
            Err(e) => {
                tracing::warn!("Failed to open response stream: {}", e);
                StreamResult {
                    content: String::new(),
                    outcome: TurnOutcome::Failed(format!("Connection error: {}", e)),
                    usage: None,
                }
            }
        };

        let body = match &result.outcome {
            TurnOutcome::Completed => result.content,
            TurnOutcome::Failed(message) => message.clone(),
            TurnOutcome::Cancelled if result.content.is_empty() => CANCELLED_TEXT.to_string(),
            TurnOutcome::Cancelled => result.content,
        };
        if let Err(e) = coalescer.finish(body) {
            // the conversation was deleted mid-turn
            tracing::debug!("Could not finalize {}: {}", ids.assistant_message_id, e);
        }

        if cancel.is_cancelled() {
            self.cancel_remote(&ids.assistant_message_id).await;
        }

        tracing::debug!(
            "Turn ended: {:?} ({} frames)",
            result.outcome,
            coalescer.frames_written()
        );
        self.emit(EngineEvent::TurnEnd {
            message_id: ids.assistant_message_id,
            outcome: result.outcome.clone(),
            usage: result.usage,
        });
        Ok(result.outcome)
    }

    /// Process chunks in arrival order until the stream ends
    async fn consume(
        &self,
        stream: &mut ChatStream,
        coalescer: &RenderCoalescer,
        message_id: &str,
        mut pending_remap: Option<String>,
        cancel: &CancellationToken,
    ) -> StreamResult {
        let mut content = String::new();
        let mut usage = None;
        let mut outcome = None;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Response stream failed: {}", e);
                    outcome = Some(TurnOutcome::Failed(format!("Connection error: {}", e)));
                    break;
                }
            };

            if let Some(new_id) = chunk.conversation_id() {
                if let Some(old_id) = pending_remap.take() {
                    self.remap(&old_id, new_id);
                }
            }

            match chunk {
                StreamChunk::Text { content: delta, .. } => {
                    content.push_str(&delta);
                    coalescer.commit(content.clone());
                }
                StreamChunk::Status { content, .. } => {
                    self.emit(EngineEvent::Status { content });
                }
                StreamChunk::ToolResult {
                    content, tool_name, ..
                } => {
                    self.emit(EngineEvent::ToolResult { tool_name, content });
                }
                StreamChunk::EntitiesDetected { entities, .. } => {
                    if let Some(entities) = entities {
                        if let Err(e) = self.store.attach_entities(message_id, entities.clone()) {
                            tracing::debug!("Dropped entities: {}", e);
                        }
                        self.emit(EngineEvent::EntitiesDetected {
                            message_id: message_id.to_string(),
                            entities,
                        });
                    }
                }
                StreamChunk::Done {
                    usage: chunk_usage,
                    uncertainty,
                    ..
                } => {
                    if chunk_usage.is_some() || uncertainty.is_some() {
                        if let Err(e) =
                            self.store
                                .attach_metadata(message_id, chunk_usage.clone(), uncertainty)
                        {
                            tracing::debug!("Dropped metadata: {}", e);
                        }
                    }
                    usage = chunk_usage;
                    outcome = Some(TurnOutcome::Completed);
                }
                StreamChunk::Error { content, .. } => {
                    let message = if content.trim().is_empty() {
                        UNKNOWN_ERROR_TEXT.to_string()
                    } else {
                        content
                    };
                    tracing::warn!("Backend reported an error: {}", message);
                    outcome = Some(TurnOutcome::Failed(message));
                }
                StreamChunk::Cancelled { .. } => {
                    outcome = Some(TurnOutcome::Cancelled);
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            if cancel.is_cancelled() {
                TurnOutcome::Cancelled
            } else {
                TurnOutcome::Failed(format!("Connection error: {}", parley_api::Error::StreamEnded))
            }
        });
        StreamResult {
            content,
            outcome,
            usage,
        }
    }

    fn remap(&self, old_id: &str, new_id: &str) {
        match self.store.remap_conversation_id(old_id, new_id) {
            Ok(()) => {
                tracing::debug!("Conversation {} is now {}", old_id, new_id);
                self.emit(EngineEvent::ConversationRemapped {
                    old_id: old_id.to_string(),
                    new_id: new_id.to_string(),
                });
            }
            Err(e) => tracing::debug!("Skipped remap of {}: {}", old_id, e),
        }
    }

    /// Ask the backend to stop generating, if it knows the conversation
    async fn cancel_remote(&self, message_id: &str) {
        let Some(conversation_id) = self.store.conversation_of(message_id) else {
            return;
        };
        let synced = self
            .store
            .conversation(&conversation_id)
            .is_some_and(|c| c.synced);
        if !synced {
            return;
        }
        match self.backend.cancel_generation(&conversation_id).await {
            Ok(cancelled) => tracing::debug!(
                "Backend cancel for {}: {}",
                conversation_id,
                cancelled
            ),
            Err(e) => tracing::warn!("Failed to cancel generation for {}: {}", conversation_id, e),
        }
    }
}
