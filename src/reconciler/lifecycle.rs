//! Conversation lifecycle: load, create, select, delete, close

use super::{ChatError, Reconciler, StoreEvent};
use crate::model::{Conversation, ConversationStatus};
use crate::transport::RequestTransport;

impl<R: RequestTransport> Reconciler<R> {
    /// Fetch the conversation list; selects the first one when nothing is
    /// active
    pub async fn load_conversations(&self) -> Result<(), ChatError> {
        let conversations = match self.api.list_conversations().await {
            Ok(list) => list,
            Err(e) => return Err(self.fail(e).await),
        };
        tracing::info!(count = conversations.len(), "Loaded conversations");

        let next = {
            let mut store = self.lock();
            store.replace_conversations(conversations);
            if store.active_id().is_some() {
                None
            } else {
                Some(store.first_id())
            }
        };
        self.emit(StoreEvent::ConversationsChanged);

        match next {
            Some(Some(id)) => self.select_conversation(&id).await,
            Some(None) => {
                self.connection.unbind().await;
                self.emit(StoreEvent::ActiveChanged {
                    conversation_id: None,
                });
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Create a conversation titled `Conversation N` and make it active
    pub async fn create_conversation(&self) -> Result<String, ChatError> {
        let title = format!("Conversation {}", self.lock().len() + 1);
        let created = match self.api.create_conversation(&title).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(e).await),
        };
        tracing::info!(conv_id = %created.id, title = %created.title, "Created conversation");

        self.lock()
            .upsert_conversation(Conversation::new(created.id.clone(), created.title));
        self.emit(StoreEvent::ConversationsChanged);
        self.activate(&created.id).await?;
        Ok(created.id)
    }

    /// Make a conversation active and bind the channel to it
    pub async fn activate(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.lock().select(conversation_id)?;
        self.emit(StoreEvent::ActiveChanged {
            conversation_id: Some(conversation_id.to_string()),
        });
        self.connection.bind(conversation_id).await;
        Ok(())
    }

    /// Switch to a conversation and load its history.
    ///
    /// A conversation this client has not seen yet is fetched first.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        let known = self.lock().conversation(conversation_id).is_some();
        if !known {
            let conversation = match self.api.get_conversation(conversation_id).await {
                Ok(conversation) => conversation,
                Err(e) => {
                    tracing::warn!(conv_id = %conversation_id, error = %e, "Conversation lookup failed");
                    return Err(ChatError::ConversationNotFound(conversation_id.to_string()));
                }
            };
            self.lock().upsert_conversation(conversation);
            self.emit(StoreEvent::ConversationsChanged);
        }

        self.activate(conversation_id).await?;
        self.refresh_history(conversation_id).await
    }

    /// Delete remotely, then locally. If it was active, the next remaining
    /// conversation is selected, or the channel is unbound.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        if let Err(e) = self.api.delete_conversation(conversation_id).await {
            return Err(self.fail(e).await);
        }

        let (was_active, next) = {
            let mut store = self.lock();
            let was_active = store.is_active(conversation_id);
            store.remove_conversation(conversation_id);
            (was_active, store.first_id())
        };
        tracing::info!(conv_id = %conversation_id, was_active, "Deleted conversation");
        self.emit(StoreEvent::ConversationsChanged);

        if !was_active {
            return Ok(());
        }
        match next {
            Some(id) => self.select_conversation(&id).await,
            None => {
                self.connection.unbind().await;
                self.emit(StoreEvent::ActiveChanged {
                    conversation_id: None,
                });
                Ok(())
            }
        }
    }

    /// Mark a conversation closed on the server
    pub async fn close_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        if let Err(e) = self.api.close_conversation(conversation_id).await {
            return Err(self.fail(e).await);
        }
        self.lock()
            .set_status(conversation_id, ConversationStatus::Closed)?;
        self.emit(StoreEvent::ConversationsChanged);
        Ok(())
    }

    /// Clear the active timeline locally
    pub fn clear_messages(&self) -> Result<(), ChatError> {
        let conversation_id = {
            let mut store = self.lock();
            let id = store
                .active_id()
                .map(str::to_string)
                .ok_or(ChatError::NoConversation)?;
            store.clear_messages(&id)?;
            id
        };
        self.emit(StoreEvent::TimelineChanged { conversation_id });
        Ok(())
    }
}
