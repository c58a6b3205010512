//! Logical chat endpoints over the request transport
//!
//! Response shapes vary between endpoints and server versions, so lists
//! and ids are looked up in every place the server has been seen to put
//! them.

use crate::model::{ChatMessage, Conversation, ConversationStatus};
use crate::transport::{Method, RequestTransport, TransportError};
use crate::wire::{
    ApiConversation, ApiMessage, CreateConversationBody, Envelope, SendMessageBody,
    StatusUpdateBody,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Endpoint paths, relative to the API base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPaths {
    pub sessions: String,
    pub session: String,
    pub messages: String,
    pub channel: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        Self {
            sessions: "/chat/sessions".to_string(),
            session: "/chat/session".to_string(),
            messages: "/chat/messages".to_string(),
            channel: "/chat/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered `success: false`
    #[error("{0}")]
    Rejected(String),
    #[error("Unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Transport(e) if e.is_auth())
    }
}

/// Result of creating a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConversation {
    pub id: String,
    pub title: String,
}

/// What the send-message endpoint answered with
#[derive(Debug, Clone, PartialEq)]
pub enum SendReply {
    /// The assistant's reply came back inline
    Inline(ChatMessage),
    /// Accepted without an inline reply; the timeline must be re-fetched
    Refetch,
}

pub struct ChatApi<R> {
    transport: R,
    paths: ApiPaths,
}

impl<R: RequestTransport> ChatApi<R> {
    pub fn new(transport: R, paths: ApiPaths) -> Self {
        Self { transport, paths }
    }

    pub fn paths(&self) -> &ApiPaths {
        &self.paths
    }

    pub async fn create_conversation(&self, title: &str) -> Result<CreatedConversation, ApiError> {
        let env = self
            .call(
                Method::POST,
                &self.paths.sessions,
                Some(&CreateConversationBody { title }),
            )
            .await?;

        let id = env
            .field("sessionId")
            .or_else(|| env.field("id"))
            .and_then(id_string)
            .ok_or_else(|| ApiError::Malformed("create response has no sessionId".into()))?;
        let title = env
            .field("title")
            .and_then(Value::as_str)
            .map_or_else(|| title.to_string(), str::to_string);

        Ok(CreatedConversation { id, title })
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let env = self.call(Method::GET, &self.paths.sessions, None::<&()>).await?;
        let items = find_list(&env, "sessions");
        Ok(parse_items::<ApiConversation>(items, "conversation")
            .into_iter()
            .map(Conversation::from)
            .collect())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, ApiError> {
        let path = with_session(&self.paths.session, id);
        let env = self.call(Method::GET, &path, None::<&()>).await?;
        let data = env
            .data()
            .cloned()
            .ok_or_else(|| ApiError::Malformed("conversation response has no data".into()))?;
        serde_json::from_value::<ApiConversation>(data)
            .map(Conversation::from)
            .map_err(|e| ApiError::Malformed(format!("conversation: {e}")))
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError> {
        let path = with_session(&self.paths.messages, conversation_id);
        let env = self.call(Method::GET, &path, None::<&()>).await?;
        let items = find_list(&env, "messages");
        Ok(parse_items::<ApiMessage>(items, "message")
            .into_iter()
            .map(ChatMessage::from)
            .collect())
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> Result<SendReply, ApiError> {
        let body = SendMessageBody {
            session_id: conversation_id,
            message,
        };
        let env = self
            .call(Method::POST, &self.paths.messages, Some(&body))
            .await?;

        // Only `reply` is the assistant's answer; `data` may echo the user's
        // own message, so it is reloaded with the rest of the history
        let reply = env
            .extra
            .get("reply")
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value::<ApiMessage>(v.clone()).ok());

        Ok(match reply {
            Some(msg) => SendReply::Inline(msg.into()),
            None => SendReply::Refetch,
        })
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<(), ApiError> {
        let path = with_session(&self.paths.session, id);
        self.call(Method::DELETE, &path, None::<&()>).await?;
        Ok(())
    }

    pub async fn close_conversation(&self, id: &str) -> Result<(), ApiError> {
        let path = with_session(&self.paths.session, id);
        let body = StatusUpdateBody {
            status: ConversationStatus::Closed,
        };
        self.call(Method::PUT, &path, Some(&body)).await?;
        Ok(())
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Envelope, ApiError> {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ApiError::Malformed(format!("request body: {e}")))?;
        let value = self.transport.request(method, path, body).await?;
        let env: Envelope = serde_json::from_value(value)
            .map_err(|e| ApiError::Malformed(format!("envelope: {e}")))?;

        if !env.success {
            let message = env
                .message
                .clone()
                .unwrap_or_else(|| "Request rejected".to_string());
            return Err(ApiError::Rejected(message));
        }
        Ok(env)
    }
}

fn with_session(path: &str, id: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
    format!("{path}?sessionId={encoded}")
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `data.<key>`, then top-level `<key>`, then `data` itself
fn find_list<'a>(env: &'a Envelope, key: &str) -> &'a [Value] {
    env.data()
        .and_then(|d| d.get(key))
        .or_else(|| env.extra.get(key))
        .or_else(|| env.data())
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_items<T: DeserializeOwned>(items: &[Value], what: &str) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed {what}");
                None
            }
        })
        .collect()
}
