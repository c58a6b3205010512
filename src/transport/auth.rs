//! Bearer credential source

use std::sync::RwLock;

/// Supplies the bearer credential for requests and channel URLs
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;

    /// Forget the credential (after the server rejected it)
    fn clear(&self);
}

/// Process-lifetime token holder
#[derive(Debug, Default)]
pub struct MemoryTokenProvider {
    token: RwLock<Option<String>>,
}

impl MemoryTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(token.into());
    }
}

impl TokenProvider for MemoryTokenProvider {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        tracing::warn!("Clearing rejected credential");
        let mut guard = self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }
}
