//! Conversation and message types held by the session store

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix for identifiers minted on this client.
///
/// Server-assigned ids never carry it, so an optimistic entry cannot be
/// mistaken for an unrelated server message.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh identifier for an optimistic entry
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
}

/// Server-side classification of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    User,
    Bot,
    #[default]
    Assistant,
}

impl MessageKind {
    pub fn role(self) -> Role {
        match self {
            MessageKind::User => Role::User,
            MessageKind::Bot | MessageKind::Assistant => Role::Assistant,
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    /// Free-form medical/record annotation attached by the assistant
    pub medical_info: Option<Value>,
    /// Suggested follow-up questions, in display order
    pub related_questions: Vec<String>,
}

impl ChatMessage {
    /// Optimistic user message with a fresh local id
    pub fn local_user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            kind: MessageKind::User,
            medical_info: None,
            related_questions: Vec::new(),
        }
    }
}

/// Lifecycle status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    #[default]
    Active,
    Closed,
}

/// Delivery state of a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Created locally, synchronous request not yet resolved
    Pending,
    /// Handed to the open channel, no acknowledgement yet
    Sent,
    /// Acknowledged by the server or received from it
    Confirmed,
}

/// A message plus its delivery state
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub delivery: Delivery,
}

impl TimelineEntry {
    pub fn confirmed(message: ChatMessage) -> Self {
        Self {
            message,
            delivery: Delivery::Confirmed,
        }
    }

    /// Pending entries may still be rolled back
    pub fn is_pending(&self) -> bool {
        !matches!(self.delivery, Delivery::Confirmed)
    }
}

/// Conversation metadata plus its timeline
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeline: Vec<TimelineEntry>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: ConversationStatus::Active,
            user_id: None,
            created_at: now,
            updated_at: now,
            timeline: Vec::new(),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.timeline.iter().any(|e| &e.message.id == id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.timeline.iter().map(|e| &e.message)
    }
}

/// Parse a server timestamp.
///
/// Accepts RFC 3339 and the zone-less `YYYY-MM-DDTHH:MM:SS[.fff]` form the
/// HTTP API emits, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
