//! Typed publish/subscribe registry
//!
//! Handlers run synchronously on the publishing task, in registration
//! order, and are removed by the id returned from `subscribe`.

use crate::model::ChatMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Identity of a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Hub<T> {
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Hub<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Hub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the handler was not registered
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn publish(&self, item: &T) {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A message pushed by the server on a conversation's channel
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub conversation_id: String,
    pub message: ChatMessage,
}

pub type PushHub = Hub<Push>;
