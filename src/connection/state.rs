//! Connection state types

use std::fmt;

/// Full connection state, including the bound conversation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnState {
    /// No channel and no pending retry
    #[default]
    Disconnected,

    /// Channel open in progress.
    /// `attempt` is the number of consecutive failures before this open.
    Connecting {
        conversation_id: String,
        attempt: u32,
    },

    /// Channel is open and may be used for sends
    Connected { conversation_id: String },

    /// Last attempt failed; retry `attempt` (1-based) is scheduled
    Error {
        conversation_id: String,
        attempt: u32,
        message: String,
    },
}

impl ConnState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnState::Disconnected => ConnectionStatus::Disconnected,
            ConnState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnState::Connected { .. } => ConnectionStatus::Connected,
            ConnState::Error { .. } => ConnectionStatus::Error,
        }
    }

    /// Conversation the state is bound to, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ConnState::Disconnected => None,
            ConnState::Connecting {
                conversation_id, ..
            }
            | ConnState::Connected { conversation_id }
            | ConnState::Error {
                conversation_id, ..
            } => Some(conversation_id),
        }
    }

    pub fn is_connected_to(&self, id: &str) -> bool {
        matches!(self, ConnState::Connected { conversation_id } if conversation_id == id)
    }
}

/// Coarse status exposed to callers and the status poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}
