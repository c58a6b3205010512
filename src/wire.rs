//! Wire formats for the channel and the HTTP API
//!
//! Server payloads are parsed leniently: unknown enum strings fall back to
//! their defaults and numeric ids are accepted alongside string ids.

use crate::model::{
    parse_timestamp, ChatMessage, Conversation, ConversationStatus, MessageId, MessageKind, Role,
};
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Channel frames
// ============================================================================

/// Frame type tags sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    UserMessage,
}

/// Client → server channel frame
#[derive(Debug, Clone, Serialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ClientFrame {
    pub fn user_message(content: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::UserMessage,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_text(&self) -> String {
        // Serializing a struct of strings and a timestamp cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client push frame, before defaults are applied
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushFrame {
    #[serde(default, deserialize_with = "optional_id")]
    id: Option<String>,
    content: Option<String>,
    role: Option<String>,
    timestamp: Option<String>,
    message_type: Option<String>,
    medical_info: Option<Value>,
    related_questions: Option<Vec<String>>,
}

/// Parse a push frame into a message.
///
/// `id` and `content` are required; everything else defaults to
/// assistant / now / `ASSISTANT` / no annotation / no questions.
pub fn parse_push(text: &str) -> Result<ChatMessage, TransportError> {
    let frame: PushFrame = serde_json::from_str(text)
        .map_err(|e| TransportError::malformed_push(format!("invalid JSON: {e}")))?;

    let id = frame
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TransportError::malformed_push("missing id"))?;
    let content = frame
        .content
        .ok_or_else(|| TransportError::malformed_push("missing content"))?;

    let role = match frame.role.as_deref() {
        Some("user") => Role::User,
        _ => Role::Assistant,
    };

    Ok(ChatMessage {
        id: MessageId::from(id),
        role,
        content,
        timestamp: frame
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        kind: frame
            .message_type
            .as_deref()
            .map_or(MessageKind::Assistant, parse_kind),
        medical_info: frame.medical_info.filter(|v| !v.is_null()),
        related_questions: frame.related_questions.unwrap_or_default(),
    })
}

fn parse_kind(raw: &str) -> MessageKind {
    match raw {
        "USER" => MessageKind::User,
        "BOT" => MessageKind::Bot,
        _ => MessageKind::Assistant,
    }
}

// ============================================================================
// HTTP payloads
// ============================================================================

/// Common response envelope
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    /// Fields some endpoints put next to `data` (`sessionId`, `reply`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Look a field up at the top level first, then inside `data`
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.extra
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.data.as_ref()?.get(name).filter(|v| !v.is_null()))
    }

    /// `data` if present and not null
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref().filter(|v| !v.is_null())
    }
}

/// Message as returned by the HTTP API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessage {
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "optional_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub medical_info: Option<Value>,
    #[serde(default)]
    pub related_questions: Option<Vec<String>>,
    #[serde(default)]
    pub create_time: Option<String>,
}

impl From<ApiMessage> for ChatMessage {
    fn from(api: ApiMessage) -> Self {
        let kind = api
            .message_type
            .as_deref()
            .map_or(MessageKind::Bot, parse_kind);
        ChatMessage {
            id: MessageId::from(api.id),
            role: kind.role(),
            content: api.content,
            timestamp: api
                .create_time
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            kind,
            medical_info: api.medical_info.filter(|v| !v.is_null()),
            related_questions: api.related_questions.unwrap_or_default(),
        }
    }
}

/// Conversation as returned by the HTTP API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConversation {
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
}

impl From<ApiConversation> for Conversation {
    fn from(api: ApiConversation) -> Self {
        let mut conv = Conversation::new(api.id, api.title);
        conv.user_id = api.user_id;
        if api.status.as_deref() == Some("CLOSED") {
            conv.status = ConversationStatus::Closed;
        }
        if let Some(created) = api.create_time.as_deref().and_then(parse_timestamp) {
            conv.created_at = created;
        }
        conv.updated_at = api
            .update_time
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(conv.created_at);
        conv
    }
}

/// Body of the send-message request
#[derive(Debug, Serialize)]
pub struct SendMessageBody<'a> {
    pub session_id: &'a str,
    pub message: &'a str,
}

/// Body of the create-conversation request
#[derive(Debug, Serialize)]
pub struct CreateConversationBody<'a> {
    pub title: &'a str,
}

/// Body of the close-conversation request
#[derive(Debug, Serialize)]
pub struct StatusUpdateBody {
    pub status: ConversationStatus,
}

// ============================================================================
// Id helpers
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

fn required_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}
