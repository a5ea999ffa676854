//! Backend abstraction and the HTTP implementation

use crate::{
    error::{Error, Result},
    stream::{ChatStream, ChunkStream, decode_chunk},
    types::{
        CancelResponse, ChatRequest, CreateConversationRequest, CreatedConversation,
        RemoteConversation, RemoteMessage,
    },
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default backend location
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Default path of the streaming chat endpoint
pub const DEFAULT_STREAM_PATH: &str = "/chat/stream";

/// Trait for the conversation backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a conversation record
    async fn create_conversation(&self, title: &str) -> Result<CreatedConversation>;

    /// List one page of conversations, most recently updated first
    async fn list_conversations(&self, limit: u32, offset: u32)
    -> Result<Vec<RemoteConversation>>;

    /// Fetch the messages of a conversation in order
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<RemoteMessage>>;

    /// Delete a conversation
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    /// Open the response stream for one user turn
    async fn stream_chat(&self, request: &ChatRequest, cancel: CancellationToken)
    -> Result<ChatStream>;

    /// Ask the backend to stop generating for a conversation
    async fn cancel_generation(&self, conversation_id: &str) -> Result<bool>;
}

/// Connection settings for [`HttpBackend`]
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL, without trailing slash (e.g. `http://127.0.0.1:8000/api`)
    pub base_url: String,
    /// Path of the streaming chat endpoint, relative to `base_url`
    pub stream_path: String,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the chat backend
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackend {
    /// Create a client for the given backend
    pub fn new(config: BackendConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "base_url must be an http(s) URL, got {:?}",
                config.base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config: BackendConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    /// Get the active configuration
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.config.base_url, path)
        } else {
            format!("{}/{}", self.config.base_url, path)
        }
    }
}

/// Turn a non-success response into an API error carrying the body text
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::api(status.as_u16(), error_detail(&body)))
}

/// Extract FastAPI-style `{"detail": ...}` messages, falling back to the raw body
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_conversation(&self, title: &str) -> Result<CreatedConversation> {
        let url = self.url("/conversations");
        tracing::debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(&CreateConversationRequest {
                title: title.to_string(),
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RemoteConversation>> {
        let url = self.url("/conversations");
        tracing::debug!("GET {} (limit={}, offset={})", url, limit, offset);
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<RemoteMessage>> {
        let url = self.url(&format!("/conversations/{}/messages", conversation_id));
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let url = self.url(&format!("/conversations/{}", conversation_id));
        tracing::debug!("DELETE {}", url);
        let response = self
            .client
            .delete(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        let url = self.url(&self.config.stream_path);
        tracing::debug!(
            "POST {} (conversation: {:?})",
            url,
            request.conversation_id
        );

        let request_builder = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(request);

        let mut event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        event_source.set_retry_policy(Box::new(Never));

        Ok(ChatStream::new(create_stream(event_source), cancel))
    }

    async fn cancel_generation(&self, conversation_id: &str) -> Result<bool> {
        let url = self.url(&format!("/chat/cancel/{}", conversation_id));
        tracing::debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let answer: CancelResponse = check_status(response).await?.json().await?;
        Ok(answer.cancelled)
    }
}

/// Decode SSE events into chunks until a terminal chunk or a failure
fn create_stream(mut event_source: EventSource) -> ChunkStream {
    Box::pin(stream! {
        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {
                    tracing::debug!("Chat stream opened");
                }
                Ok(Event::Message(message)) => match decode_chunk(&message.data) {
                    Ok(Some(chunk)) => {
                        let terminal = chunk.is_terminal();
                        yield Ok(chunk);
                        if terminal {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                },
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let body = response.text().await.unwrap_or_default();
                    yield Err(Error::api(status.as_u16(), error_detail(&body)));
                    break;
                }
                Err(reqwest_eventsource::Error::Transport(e)) => {
                    yield Err(Error::Http(e));
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        event_source.close();
    })
}
