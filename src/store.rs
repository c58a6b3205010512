//! Conversation list and per-conversation timelines
//!
//! The store is the single owner of conversations. All operations are
//! synchronous; callers serialize access through one lock.

use crate::model::{
    ChatMessage, Conversation, ConversationStatus, Delivery, MessageId, Role, TimelineEntry,
};
use chrono::Utc;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
}

/// Handle to an optimistic entry, resolved by `mark_sent`, `confirm` or `rollback`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub conversation_id: String,
    pub message_id: MessageId,
}

/// What `merge` did with an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// Server echo of a message this client streamed; the local entry was
    /// replaced by the server's copy
    Reconciled,
    /// Id already present; nothing changed
    Duplicate,
    UnknownConversation,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    conversations: Vec<Conversation>,
    active: Option<String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::UnknownConversation(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn first_id(&self) -> Option<String> {
        self.conversations.first().map(|c| c.id.clone())
    }

    /// Insert a conversation, or refresh its metadata keeping the timeline
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => {
                existing.title = conversation.title;
                existing.status = conversation.status;
                existing.user_id = conversation.user_id;
                existing.created_at = conversation.created_at;
                existing.updated_at = conversation.updated_at;
            }
            None => self.conversations.push(conversation),
        }
    }

    /// Replace the list with the server's, keeping timelines already loaded.
    /// Selection is cleared if the active conversation disappeared.
    pub fn replace_conversations(&mut self, incoming: Vec<Conversation>) {
        let mut previous = std::mem::take(&mut self.conversations);
        self.conversations = incoming
            .into_iter()
            .map(|mut conv| {
                if let Some(pos) = previous.iter().position(|p| p.id == conv.id) {
                    conv.timeline = previous.swap_remove(pos).timeline;
                }
                conv
            })
            .collect();

        if let Some(active) = &self.active {
            if self.conversation(active).is_none() {
                self.active = None;
            }
        }
    }

    pub fn remove_conversation(&mut self, id: &str) -> Option<Conversation> {
        let pos = self.conversations.iter().position(|c| c.id == id)?;
        if self.is_active(id) {
            self.active = None;
        }
        Some(self.conversations.remove(pos))
    }

    pub fn set_status(&mut self, id: &str, status: ConversationStatus) -> Result<(), StoreError> {
        let conv = self.conversation_mut(id)?;
        conv.status = status;
        conv.updated_at = Utc::now();
        Ok(())
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.conversation(self.active.as_deref()?)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.as_deref() == Some(id)
    }

    pub fn select(&mut self, id: &str) -> Result<(), StoreError> {
        if self.conversation(id).is_none() {
            return Err(StoreError::UnknownConversation(id.to_string()));
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    // ========================================================================
    // Optimistic send
    // ========================================================================

    /// Append a pending user message with a fresh local id
    pub fn begin_send(
        &mut self,
        conversation_id: &str,
        content: &str,
    ) -> Result<PendingSend, StoreError> {
        let conv = self.conversation_mut(conversation_id)?;
        let message = ChatMessage::local_user(content);
        let message_id = message.id.clone();
        conv.timeline.push(TimelineEntry {
            message,
            delivery: Delivery::Pending,
        });
        conv.updated_at = Utc::now();

        Ok(PendingSend {
            conversation_id: conversation_id.to_string(),
            message_id,
        })
    }

    /// Handed to the channel; still counts as pending
    pub fn mark_sent(&mut self, pending: &PendingSend) -> bool {
        self.resolve(pending, Delivery::Sent)
    }

    pub fn confirm(&mut self, pending: &PendingSend) -> bool {
        self.resolve(pending, Delivery::Confirmed)
    }

    fn resolve(&mut self, pending: &PendingSend, delivery: Delivery) -> bool {
        let Some(entry) = self.pending_entry_mut(pending) else {
            return false;
        };
        entry.delivery = delivery;
        true
    }

    /// Remove the optimistic entry. Confirmed entries are never removed.
    pub fn rollback(&mut self, pending: &PendingSend) -> bool {
        let Ok(conv) = self.conversation_mut(&pending.conversation_id) else {
            return false;
        };
        let Some(pos) = conv
            .timeline
            .iter()
            .position(|e| e.message.id == pending.message_id && e.is_pending())
        else {
            return false;
        };
        conv.timeline.remove(pos);
        true
    }

    fn pending_entry_mut(&mut self, pending: &PendingSend) -> Option<&mut TimelineEntry> {
        self.conversation_mut(&pending.conversation_id)
            .ok()?
            .timeline
            .iter_mut()
            .find(|e| e.message.id == pending.message_id && e.is_pending())
    }

    // ========================================================================
    // Incoming messages
    // ========================================================================

    /// Merge a server message, dropping duplicates by id
    pub fn merge(&mut self, conversation_id: &str, message: ChatMessage) -> MergeOutcome {
        let Ok(conv) = self.conversation_mut(conversation_id) else {
            return MergeOutcome::UnknownConversation;
        };
        if conv.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }

        conv.updated_at = Utc::now();

        // Echo of a streamed user message confirms the local entry in place
        if message.role == Role::User {
            if let Some(entry) = conv.timeline.iter_mut().find(|e| {
                e.delivery == Delivery::Sent && e.message.content == message.content
            }) {
                *entry = TimelineEntry::confirmed(message);
                return MergeOutcome::Reconciled;
            }
        }

        conv.timeline.push(TimelineEntry::confirmed(message));
        MergeOutcome::Appended
    }

    /// Install an authoritative history.
    ///
    /// The server list replaces the timeline; entries still `Pending` (a
    /// synchronous send in flight) are kept after it.
    pub fn replace_history(
        &mut self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(), StoreError> {
        let conv = self.conversation_mut(conversation_id)?;

        let mut seen = HashSet::new();
        let mut timeline: Vec<TimelineEntry> = messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .map(TimelineEntry::confirmed)
            .collect();
        timeline.extend(
            conv.timeline
                .drain(..)
                .filter(|e| e.delivery == Delivery::Pending && !seen.contains(&e.message.id)),
        );

        conv.timeline = timeline;
        Ok(())
    }

    pub fn clear_messages(&mut self, conversation_id: &str) -> Result<(), StoreError> {
        self.conversation_mut(conversation_id)?.timeline.clear();
        Ok(())
    }
}
