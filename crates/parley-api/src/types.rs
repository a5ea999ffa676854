//! Wire types exchanged with the chat backend

use serde::{Deserialize, Deserializer, Serialize};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Token usage reported with a finished turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated cost of the turn in euros
    pub cost_eur: Option<f64>,
    /// Model that produced the answer
    pub model: Option<String>,
}

/// Confidence bucket derived from the backend's uncertainty scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    #[default]
    High,
    Medium,
    Low,
}

/// Uncertainty indicators attached to an assistant answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Uncertainty {
    pub is_uncertain: bool,
    /// Hedging phrases found in the answer
    pub uncertainty_phrases: Vec<String>,
    /// 0-100, higher is more confident
    pub confidence_score: u32,
    pub confidence_level: ConfidenceLevel,
    /// Whether the user should double check the answer
    pub should_verify: bool,
}

impl Default for Uncertainty {
    fn default() -> Self {
        Self {
            is_uncertain: false,
            uncertainty_phrases: vec![],
            confidence_score: 100,
            confidence_level: ConfidenceLevel::High,
            should_verify: false,
        }
    }
}

/// A conversation entry as listed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub message_count: u32,
    /// Unix milliseconds
    #[serde(default, deserialize_with = "timestamp_millis")]
    pub created_at: i64,
    /// Unix milliseconds
    #[serde(default, deserialize_with = "timestamp_millis")]
    pub updated_at: i64,
}

/// A persisted message as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Unix milliseconds
    #[serde(default, deserialize_with = "timestamp_millis")]
    pub created_at: i64,
}

/// Answer to `POST /conversations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedConversation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Body of `POST /conversations`
#[derive(Debug, Clone, Serialize)]
pub struct CreateConversationRequest {
    pub title: String,
}

/// Body of the streaming chat request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub include_memory: bool,
    pub stream: bool,
}

impl ChatRequest {
    /// Create a streaming request for one user turn
    pub fn new(message: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id,
            include_memory: true,
            stream: true,
        }
    }

    /// Set whether the backend should inject long-term memory into the prompt
    pub fn with_memory(mut self, include_memory: bool) -> Self {
        self.include_memory = include_memory;
        self
    }
}

/// Answer to the generation cancel endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Parse a backend timestamp into Unix milliseconds.
///
/// Accepts RFC 3339 and offset-less ISO-8601 values (read as UTC).
pub fn parse_timestamp(value: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn timestamp_millis<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Millis(ms)) => ms,
        Some(Raw::Text(text)) => parse_timestamp(&text).unwrap_or_else(|| {
            tracing::debug!("Unparseable backend timestamp: {}", text);
            0
        }),
        None => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_rfc3339() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_timestamp("1970-01-01T01:00:01+01:00"), Some(1000));
    }

    #[test]
    fn test_parse_timestamp_naive_is_utc() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:02.500000"), Some(2500));
        assert_eq!(parse_timestamp("1970-01-01T00:00:02"), Some(2000));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_remote_conversation_from_backend_json() {
        let json = r#"{
            "id": "c1",
            "title": "Quarterly numbers",
            "summary": null,
            "message_count": 4,
            "created_at": "2025-03-01T10:00:00",
            "updated_at": "2025-03-01T10:05:00.123456"
        }"#;
        let conv: RemoteConversation = serde_json::from_str(json).unwrap();
        assert_eq!(conv.id, "c1");
        assert_eq!(conv.title.as_deref(), Some("Quarterly numbers"));
        assert_eq!(conv.message_count, 4);
        assert_eq!(conv.updated_at - conv.created_at, 300_123);
    }

    #[test]
    fn test_remote_message_role() {
        let json = r#"{"id":"m1","conversation_id":"c1","role":"assistant","content":"hi","created_at":"2025-03-01T10:00:00Z"}"#;
        let msg: RemoteMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn test_chat_request_omits_missing_conversation() {
        let body = serde_json::to_value(ChatRequest::new("hello", None)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"message": "hello", "include_memory": true, "stream": true})
        );

        let body =
            serde_json::to_value(ChatRequest::new("hello", Some("c1".into())).with_memory(false))
                .unwrap();
        assert_eq!(body["conversation_id"], "c1");
        assert_eq!(body["include_memory"], false);
    }

    #[test]
    fn test_uncertainty_defaults_when_partial() {
        let u: Uncertainty = serde_json::from_str(r#"{"is_uncertain": true}"#).unwrap();
        assert!(u.is_uncertain);
        assert_eq!(u.confidence_score, 100);
        assert_eq!(u.confidence_level, ConfidenceLevel::High);
    }
}
