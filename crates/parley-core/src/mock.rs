//! Scripted backend for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_api::{
    Backend, ChatRequest, ChatStream, CreatedConversation, Error as ApiError, RemoteConversation,
    RemoteMessage, Result as ApiResult, Role, StreamChunk,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) type ChunkSender = mpsc::UnboundedSender<ApiResult<StreamChunk>>;
type ChunkReceiver = mpsc::UnboundedReceiver<ApiResult<StreamChunk>>;

#[derive(Default)]
pub(crate) struct MockBackend {
    pub list: Mutex<Vec<RemoteConversation>>,
    pub list_fails: AtomicBool,
    pub list_calls: AtomicUsize,
    pub messages: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    pub messages_fail: AtomicBool,
    pub message_calls: AtomicUsize,
    pub delete_fails: AtomicBool,
    pub deleted: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    scripts: Mutex<VecDeque<ChunkReceiver>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream that yields `chunks` and then ends
    pub fn push_stream(&self, chunks: Vec<ApiResult<StreamChunk>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in chunks {
            let _ = tx.send(chunk);
        }
        self.scripts.lock().push_back(rx);
    }

    /// Queue a stream fed by the returned sender; it ends when the sender drops
    pub fn push_gated_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(rx);
        tx
    }

    pub fn set_list(&self, list: Vec<RemoteConversation>) {
        *self.list.lock() = list;
    }

    pub fn set_messages(&self, conversation_id: &str, contents: &[(&str, Role)]) {
        let messages = contents
            .iter()
            .enumerate()
            .map(|(i, (content, role))| RemoteMessage {
                id: format!("{}-m{}", conversation_id, i),
                role: *role,
                content: content.to_string(),
                created_at: i as i64,
            })
            .collect();
        self.messages
            .lock()
            .insert(conversation_id.to_string(), messages);
    }
}

pub(crate) fn remote_conversation(id: &str, title: &str, message_count: u32) -> RemoteConversation {
    RemoteConversation {
        id: id.into(),
        title: Some(title.into()),
        summary: None,
        message_count,
        created_at: 1_000,
        updated_at: 2_000,
    }
}

pub(crate) fn text(content: &str, conversation_id: Option<&str>) -> ApiResult<StreamChunk> {
    Ok(StreamChunk::Text {
        content: content.into(),
        conversation_id: conversation_id.map(String::from),
    })
}

pub(crate) fn done(conversation_id: Option<&str>) -> ApiResult<StreamChunk> {
    Ok(StreamChunk::Done {
        conversation_id: conversation_id.map(String::from),
        message_id: None,
        usage: None,
        uncertainty: None,
    })
}

#[async_trait]
impl Backend for MockBackend {
    async fn create_conversation(&self, title: &str) -> ApiResult<CreatedConversation> {
        let mut created = self.created.lock();
        created.push(title.to_string());
        Ok(CreatedConversation {
            id: format!("created-{}", created.len()),
            title: Some(title.to_string()),
        })
    }

    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> ApiResult<Vec<RemoteConversation>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(ApiError::api(503, "unavailable"));
        }
        Ok(self
            .list
            .lock()
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_messages(&self, conversation_id: &str) -> ApiResult<Vec<RemoteMessage>> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if self.messages_fail.load(Ordering::SeqCst) {
            return Err(ApiError::api(500, "boom"));
        }
        Ok(self
            .messages
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> ApiResult<()> {
        self.deleted.lock().push(conversation_id.to_string());
        if self.delete_fails.load(Ordering::SeqCst) {
            return Err(ApiError::api(404, "Conversation not found"));
        }
        Ok(())
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> ApiResult<ChatStream> {
        self.requests.lock().push(request.clone());
        let Some(mut rx) = self.scripts.lock().pop_front() else {
            return Err(ApiError::Sse("no scripted stream".into()));
        };
        let inner = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(ChatStream::new(Box::pin(inner), cancel))
    }

    async fn cancel_generation(&self, conversation_id: &str) -> ApiResult<bool> {
        self.cancelled.lock().push(conversation_id.to_string());
        Ok(true)
    }
}
