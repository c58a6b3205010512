//! Message reconciliation
//!
//! Merges three sources into each conversation's timeline: optimistic
//! local sends, server pushes from the channel, and synchronous request
//! results. The store lock is never held across an await.

mod lifecycle;

use crate::api::{ApiError, ChatApi, SendReply};
use crate::connection::{ConnectionManager, SendError};
use crate::hub::HandlerId;
use crate::model::{ChatMessage, Conversation, MessageId, TimelineEntry};
use crate::store::{MergeOutcome, PendingSend, SessionStore, StoreError};
use crate::transport::RequestTransport;
use crate::wire::ClientFrame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Errors surfaced to callers of the reconciler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("Not connected")]
    NotConnected,
    /// The message was rolled back and may be sent again
    #[error("Message not delivered: {0}")]
    Send(String),
    #[error("Request failed: {0}")]
    Request(String),
    /// Credential rejected; the session has ended
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("No conversation selected")]
    NoConversation,
    #[error("Rejected by server: {0}")]
    Rejected(String),
    #[error("Message is empty")]
    EmptyMessage,
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::NotConnected | ChatError::Send(_) | ChatError::Request(_)
        )
    }
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(e) if e.is_auth() => ChatError::Auth(e.message),
            ApiError::Transport(e) => ChatError::Request(e.message),
            ApiError::Rejected(message) => ChatError::Rejected(message),
            ApiError::Malformed(message) => ChatError::Request(message),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownConversation(id) => ChatError::ConversationNotFound(id),
        }
    }
}

impl From<SendError> for ChatError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotConnected => ChatError::NotConnected,
            SendError::Transport(e) => ChatError::Send(e.message),
        }
    }
}

/// Change notifications for renderers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ConversationsChanged,
    ActiveChanged { conversation_id: Option<String> },
    TimelineChanged { conversation_id: String },
    Error { message: String },
    SessionEnded { reason: String },
}

/// How a send was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open channel; the entry stays pending until echoed
    Streamed(MessageId),
    /// Synchronous request answered with an inline reply
    Replied(MessageId),
    /// Synchronous request accepted; history was re-fetched
    Refetched(MessageId),
    /// The selection changed while the request was in flight
    Discarded(MessageId),
}

impl SendOutcome {
    pub fn message_id(&self) -> &MessageId {
        match self {
            SendOutcome::Streamed(id)
            | SendOutcome::Replied(id)
            | SendOutcome::Refetched(id)
            | SendOutcome::Discarded(id) => id,
        }
    }
}

pub struct Reconciler<R: RequestTransport> {
    store: Arc<Mutex<SessionStore>>,
    api: ChatApi<R>,
    connection: ConnectionManager,
    events: broadcast::Sender<StoreEvent>,
    push_handler: HandlerId,
}

impl<R: RequestTransport> Reconciler<R> {
    /// Build a reconciler and subscribe it to the connection's pushes
    pub fn new(api: ChatApi<R>, connection: ConnectionManager) -> Self {
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let push_handler = {
            let store = store.clone();
            let events = events.clone();
            connection.add_message_handler(move |push| {
                apply_incoming(&store, &events, &push.conversation_id, push.message.clone());
            })
        };

        Self {
            store,
            api,
            connection,
            events,
            push_handler,
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a user message.
    ///
    /// Targets `conversation_id`, else the active conversation, else a newly
    /// created one. The message appears in the timeline immediately and is
    /// removed again if delivery fails.
    pub async fn send(
        &self,
        conversation_id: Option<&str>,
        text: &str,
    ) -> Result<SendOutcome, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let target = match conversation_id {
            Some(id) => id.to_string(),
            None => match self.active_id() {
                Some(id) => id,
                None => self.create_conversation().await?,
            },
        };

        let (pending, selection) = {
            let mut store = self.lock();
            let pending = store.begin_send(&target, text)?;
            (pending, store.active_id().map(str::to_string))
        };
        self.emit(StoreEvent::TimelineChanged {
            conversation_id: target.clone(),
        });

        if self.connection.state().is_connected_to(&target) {
            let frame = ClientFrame::user_message(text);
            match self.connection.send_to(&target, &frame).await {
                Ok(()) => {
                    self.lock().mark_sent(&pending);
                    tracing::debug!(conv_id = %target, message_id = %pending.message_id, "Message streamed");
                    return Ok(SendOutcome::Streamed(pending.message_id));
                }
                Err(e) => {
                    tracing::warn!(conv_id = %target, error = %e, "Channel send failed, falling back to request");
                }
            }
        }

        self.send_sync(pending, selection, text).await
    }

    async fn send_sync(
        &self,
        pending: PendingSend,
        selection: Option<String>,
        text: &str,
    ) -> Result<SendOutcome, ChatError> {
        let conversation_id = pending.conversation_id.clone();
        let result = self.api.send_message(&conversation_id, text).await;

        let stale = {
            let store = self.lock();
            store.active_id() != selection.as_deref()
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.lock().rollback(&pending);
                self.emit(StoreEvent::TimelineChanged {
                    conversation_id: conversation_id.clone(),
                });
                tracing::warn!(conv_id = %conversation_id, error = %e, "Send failed, rolled back");
                if e.is_auth() {
                    return Err(self.fail(e).await);
                }
                let err = ChatError::Send(e.to_string());
                self.emit(StoreEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        if stale {
            // Left unconfirmed; the next history load replaces it
            self.lock().mark_sent(&pending);
            tracing::debug!(conv_id = %conversation_id, "Discarding send result after selection changed");
            return Ok(SendOutcome::Discarded(pending.message_id));
        }

        self.lock().confirm(&pending);
        match reply {
            SendReply::Inline(message) => {
                apply_incoming(&self.store, &self.events, &conversation_id, message);
                Ok(SendOutcome::Replied(pending.message_id))
            }
            SendReply::Refetch => {
                if let Err(e) = self.refresh_history(&conversation_id).await {
                    tracing::warn!(conv_id = %conversation_id, error = %e, "Re-fetch after send failed");
                }
                Ok(SendOutcome::Refetched(pending.message_id))
            }
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Merge a server message into a conversation, dropping duplicates
    pub fn on_incoming(&self, conversation_id: &str, message: ChatMessage) -> MergeOutcome {
        apply_incoming(&self.store, &self.events, conversation_id, message)
    }

    /// Replace the conversation's timeline with the server's history.
    ///
    /// The result is dropped if the conversation stopped being active while
    /// the request was in flight.
    pub async fn refresh_history(&self, conversation_id: &str) -> Result<(), ChatError> {
        let messages = match self.api.get_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => return Err(self.fail(e).await),
        };

        {
            let mut store = self.lock();
            if !store.is_active(conversation_id) {
                tracing::debug!(conv_id = %conversation_id, "Discarding history for inactive conversation");
                return Ok(());
            }
            store.replace_history(conversation_id, messages)?;
        }

        self.emit(StoreEvent::TimelineChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn active_id(&self) -> Option<String> {
        self.lock().active_id().map(str::to_string)
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.lock().active().cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations().to_vec()
    }

    pub fn timeline(&self, conversation_id: &str) -> Option<Vec<TimelineEntry>> {
        self.lock()
            .conversation(conversation_id)
            .map(|c| c.timeline.clone())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Convert an API failure, publishing it and ending the session on auth errors
    async fn fail(&self, err: ApiError) -> ChatError {
        let err = ChatError::from(err);
        if let ChatError::Auth(reason) = &err {
            self.end_session(reason.clone()).await;
        } else {
            self.emit(StoreEvent::Error {
                message: err.to_string(),
            });
        }
        err
    }

    /// Drop all local state after the credential was rejected
    async fn end_session(&self, reason: String) {
        tracing::warn!(reason = %reason, "Ending session");
        self.connection.unbind().await;
        *self.lock() = SessionStore::new();
        self.emit(StoreEvent::SessionEnded { reason });
    }
}

impl<R: RequestTransport> Drop for Reconciler<R> {
    fn drop(&mut self) {
        self.connection.remove_message_handler(self.push_handler);
    }
}

fn apply_incoming(
    store: &Mutex<SessionStore>,
    events: &broadcast::Sender<StoreEvent>,
    conversation_id: &str,
    message: ChatMessage,
) -> MergeOutcome {
    let message_id = message.id.clone();
    let outcome = store
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .merge(conversation_id, message);

    match outcome {
        MergeOutcome::Appended | MergeOutcome::Reconciled => {
            let _ = events.send(StoreEvent::TimelineChanged {
                conversation_id: conversation_id.to_string(),
            });
        }
        MergeOutcome::Duplicate => {
            tracing::debug!(conv_id = %conversation_id, message_id = %message_id, "Dropping duplicate message");
        }
        MergeOutcome::UnknownConversation => {
            tracing::warn!(conv_id = %conversation_id, message_id = %message_id, "Message for unknown conversation");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiPaths;
    use crate::connection::{ConnectionStatus, ReconnectPolicy};
    use crate::model::{Delivery, Role};
    use crate::testing::{test_endpoint, MockChannelTransport, MockRequestTransport};
    use crate::transport::{Method, TransportError};
    use serde_json::json;
    use std::time::Duration;

    pub(super) struct Harness {
        pub channels: Arc<MockChannelTransport>,
        pub requests: Arc<MockRequestTransport>,
        pub reconciler: Arc<Reconciler<Arc<MockRequestTransport>>>,
    }

    pub(super) fn harness() -> Harness {
        let channels = Arc::new(MockChannelTransport::new());
        let requests = Arc::new(MockRequestTransport::new());
        let connection =
            ConnectionManager::spawn(channels.clone(), test_endpoint(), ReconnectPolicy::default());
        let api = ChatApi::new(requests.clone(), ApiPaths::default());
        Harness {
            channels,
            requests,
            reconciler: Arc::new(Reconciler::new(api, connection)),
        }
    }

    impl Harness {
        pub fn seed(&self, ids: &[&str]) {
            let mut store = self.reconciler.lock();
            for id in ids {
                store.upsert_conversation(Conversation::new(*id, format!("Conversation {id}")));
            }
        }

        pub async fn wait_connected(&self) {
            let mut rx = self.reconciler.connection().watch();
            tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|s| s.status() == ConnectionStatus::Connected),
            )
            .await
            .expect("never connected")
            .expect("actor stopped");
        }

        pub fn contents(&self, id: &str) -> Vec<String> {
            self.reconciler
                .timeline(id)
                .unwrap()
                .into_iter()
                .map(|e| e.message.content)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_connected_send_appends_one_pending_entry() {
        let h = harness();
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.wait_connected().await;

        let outcome = h.reconciler.send(None, "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Streamed(_)));

        let timeline = h.reconciler.timeline("a").unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message.content, "hello");
        assert_eq!(&timeline[0].message.id, outcome.message_id());
        assert!(timeline[0].is_pending());

        assert_eq!(h.channels.channel(1).unwrap().sent().len(), 1);
        assert!(h.requests.requests().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_send_confirmed_by_echo() {
        let h = harness();
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.wait_connected().await;
        h.reconciler.send(None, "hello").await.unwrap();

        let mut events = h.reconciler.subscribe();
        let listener = h.channels.listener(1).unwrap();
        listener.on_message(r#"{"id":"srv-1","role":"user","content":"hello","messageType":"USER"}"#);
        listener.on_message(r#"{"id":"srv-2","content":"hi there"}"#);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
        }

        let timeline = h.reconciler.timeline("a").unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline.iter().all(|e| e.delivery == Delivery::Confirmed));
        assert_eq!(timeline[1].message.role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_duplicate_push_leaves_timeline_unchanged() {
        let h = harness();
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.wait_connected().await;

        let mut events = h.reconciler.subscribe();
        let listener = h.channels.listener(1).unwrap();
        listener.on_message(r#"{"id":"m1","content":"hi"}"#);
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        listener.on_message(r#"{"id":"m1","content":"hi"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.contents("a"), vec!["hi"]);
        assert!(events.try_recv().is_err());

        let duplicate = h.reconciler.timeline("a").unwrap()[0].message.clone();
        assert_eq!(h.reconciler.on_incoming("a", duplicate), MergeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_disconnected_send_uses_request_and_merges_reply() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.requests.queue_ok(json!({
            "success": true,
            "reply": {"id": 10, "messageType": "BOT", "content": "answer"}
        }));

        let outcome = h.reconciler.send(None, "question").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Replied(_)));
        assert_eq!(h.contents("a"), vec!["question", "answer"]);
        assert!(h
            .reconciler
            .timeline("a")
            .unwrap()
            .iter()
            .all(|e| e.delivery == Delivery::Confirmed));

        let request = &h.requests.requests()[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.body,
            Some(json!({"session_id": "a", "message": "question"}))
        );
    }

    #[tokio::test]
    async fn test_send_without_reply_refetches() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.requests.queue_ok(json!({"success": true}));
        h.requests.queue_ok(json!({
            "success": true,
            "data": [
                {"id": 1, "messageType": "USER", "content": "question"},
                {"id": 2, "messageType": "BOT", "content": "answer"}
            ]
        }));

        let outcome = h.reconciler.send(None, "question").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Refetched(_)));
        assert_eq!(h.contents("a"), vec!["question", "answer"]);
        let timeline = h.reconciler.timeline("a").unwrap();
        assert!(!timeline[0].message.id.is_local());
    }

    #[tokio::test]
    async fn test_send_with_echoed_data_reloads_instead_of_duplicating() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.requests.queue_ok(json!({
            "success": true,
            "data": {"id": 5, "messageType": "USER", "content": "question"}
        }));
        h.requests.queue_ok(json!({
            "success": true,
            "data": [{"id": 5, "messageType": "USER", "content": "question"}]
        }));

        let outcome = h.reconciler.send(None, "question").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Refetched(_)));
        assert_eq!(h.contents("a"), vec!["question"]);
        assert_eq!(h.requests.requests().len(), 2);
        assert_eq!(h.requests.requests()[1].method, Method::GET);
    }

    #[tokio::test]
    async fn test_history_for_previous_selection_is_discarded() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a", "b"]);
        h.reconciler.on_incoming(
            "a",
            ChatMessage {
                role: Role::Assistant,
                ..ChatMessage::local_user("earlier")
            },
        );

        let gate = h.requests.queue_gated(json!({
            "success": true,
            "data": [{"id": 1, "messageType": "BOT", "content": "late history"}]
        }));
        let reconciler = h.reconciler.clone();
        let select_a = tokio::spawn(async move { reconciler.select_conversation("a").await });
        h.requests.wait_for_requests(1).await;

        h.requests.queue_ok(json!({
            "success": true,
            "data": [{"id": 2, "messageType": "BOT", "content": "welcome to b"}]
        }));
        h.reconciler.select_conversation("b").await.unwrap();
        gate.notify_one();
        select_a.await.unwrap().unwrap();

        assert_eq!(h.contents("a"), vec!["earlier"]);
        assert_eq!(h.contents("b"), vec!["welcome to b"]);
        assert_eq!(h.reconciler.active_id().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.reconciler.on_incoming(
            "a",
            ChatMessage {
                role: Role::Assistant,
                ..ChatMessage::local_user("earlier")
            },
        );
        h.requests.queue_err(TransportError::request("Unable to reach server"));
        let mut events = h.reconciler.subscribe();

        let err = h.reconciler.send(None, "lost").await.unwrap_err();
        assert!(matches!(err, ChatError::Send(_)));
        assert!(err.is_retryable());
        assert_eq!(h.contents("a"), vec!["earlier"]);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, StoreEvent::Error { .. });
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_auth_failure_ends_session() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a"]);
        h.reconciler.activate("a").await.unwrap();
        h.requests.queue_err(TransportError::auth("Authentication rejected"));
        let mut events = h.reconciler.subscribe();

        let err = h.reconciler.send(None, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Auth(_)));
        assert!(!err.is_retryable());
        assert!(h.reconciler.conversations().is_empty());
        assert_eq!(h.reconciler.active_id(), None);
        assert_eq!(
            h.reconciler.connection().status(),
            ConnectionStatus::Disconnected
        );

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            ended |= matches!(event, StoreEvent::SessionEnded { .. });
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn test_switching_conversation_discards_in_flight_result() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a", "b"]);
        h.reconciler.activate("a").await.unwrap();

        let gate = h.requests.queue_gated(json!({
            "success": true,
            "reply": {"id": 10, "messageType": "BOT", "content": "late answer"}
        }));
        let reconciler = h.reconciler.clone();
        let send = tokio::spawn(async move { reconciler.send(None, "question").await });
        h.requests.wait_for_requests(1).await;

        h.requests.queue_ok(json!({"success": true, "data": []}));
        h.reconciler.select_conversation("b").await.unwrap();
        gate.notify_one();

        let outcome = send.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Discarded(_)));

        let a = h.reconciler.timeline("a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].message.content, "question");
        assert!(a[0].is_pending());
        assert!(h.contents("b").is_empty());
        assert_eq!(h.reconciler.active_id().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_stale_failure_still_rolls_back() {
        let h = harness();
        h.channels.fail_all_opens("refused");
        h.seed(&["a", "b"]);
        h.reconciler.activate("a").await.unwrap();

        let gate = h
            .requests
            .queue_gated(json!({"success": false, "message": "quota exceeded"}));
        let reconciler = h.reconciler.clone();
        let send = tokio::spawn(async move { reconciler.send(None, "question").await });
        h.requests.wait_for_requests(1).await;

        h.requests.queue_ok(json!({"success": true, "data": []}));
        h.reconciler.select_conversation("b").await.unwrap();
        gate.notify_one();

        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err, ChatError::Send("quota exceeded".into()));
        assert!(h.contents("a").is_empty());
    }

    #[tokio::test]
    async fn test_send_rejects_blank_text() {
        let h = harness();
        h.seed(&["a"]);
        assert_eq!(
            h.reconciler.send(Some("a"), "   ").await,
            Err(ChatError::EmptyMessage)
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_conversation() {
        let h = harness();
        assert_eq!(
            h.reconciler.send(Some("zzz"), "hi").await,
            Err(ChatError::ConversationNotFound("zzz".into()))
        );
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ChatError::from(ApiError::Transport(TransportError::auth("expired"))),
            ChatError::Auth("expired".into())
        );
        assert_eq!(
            ChatError::from(ApiError::Rejected("no".into())),
            ChatError::Rejected("no".into())
        );
        assert_eq!(ChatError::from(SendError::NotConnected), ChatError::NotConnected);
        assert!(!ChatError::Rejected("no".into()).is_retryable());
    }
}
