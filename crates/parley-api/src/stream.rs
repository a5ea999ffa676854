//! Streaming chunk types and the cancellable chunk consumer

use crate::error::{Error, Result};
use crate::types::{Uncertainty, Usage};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// One event of the backend's incremental response protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text delta for the assistant answer
    Text {
        #[serde(default)]
        content: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Progress note (file processing, tool dispatch, ...)
    Status {
        #[serde(default)]
        content: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Outcome of a backend tool invocation
    ToolResult {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Entities extracted from the turn
    EntitiesDetected {
        #[serde(default)]
        entities: Option<serde_json::Value>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Turn completed successfully
    Done {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        uncertainty: Option<Uncertainty>,
    },
    /// Turn failed on the backend
    Error {
        #[serde(default)]
        content: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Generation was cancelled server-side
    Cancelled {
        #[serde(default)]
        conversation_id: Option<String>,
    },
}

impl StreamChunk {
    /// Check if this chunk ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamChunk::Done { .. } | StreamChunk::Error { .. } | StreamChunk::Cancelled { .. }
        )
    }

    /// The backend conversation id carried by this chunk, if any
    pub fn conversation_id(&self) -> Option<&str> {
        let id = match self {
            StreamChunk::Text {
                conversation_id, ..
            }
            | StreamChunk::Status {
                conversation_id, ..
            }
            | StreamChunk::ToolResult {
                conversation_id, ..
            }
            | StreamChunk::EntitiesDetected {
                conversation_id, ..
            }
            | StreamChunk::Done {
                conversation_id, ..
            }
            | StreamChunk::Error {
                conversation_id, ..
            }
            | StreamChunk::Cancelled { conversation_id } => conversation_id,
        };
        id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Decode one SSE `data:` payload.
///
/// Returns `Ok(None)` for keep-alive payloads that carry no chunk.
pub fn decode_chunk(data: &str) -> Result<Option<StreamChunk>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("undecodable chunk: {}", e)))
}

/// A boxed stream of decoded chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A lazy, finite, non-restartable sequence of chunks for one turn.
///
/// Ends after the first terminal chunk or error. Cancelling the token (or
/// calling [`ChatStream::close`]) drops the transport; chunks already buffered
/// by it are discarded.
pub struct ChatStream {
    inner: Option<ChunkStream>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    cancel: CancellationToken,
    conversation_id: Option<String>,
    saw_terminal: bool,
}

impl ChatStream {
    /// Wrap a transport stream
    pub fn new(inner: ChunkStream, cancel: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            conversation_id: None,
            saw_terminal: false,
        }
    }

    /// The first backend conversation id seen on this stream
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Close the transport. No further chunks are delivered.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.inner = None;
    }

    /// Whether the stream was closed by its consumer
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            tracing::debug!("Chat stream cancelled, closing transport");
            this.inner = None;
            return Poll::Ready(None);
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if this.conversation_id.is_none() {
                    if let Some(id) = chunk.conversation_id() {
                        this.conversation_id = Some(id.to_string());
                    }
                }
                if chunk.is_terminal() {
                    this.saw_terminal = true;
                    this.inner = None;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.inner = None;
                if this.saw_terminal {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(Error::StreamEnded)))
                }
            }
        }
    }
}
