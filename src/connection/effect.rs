//! Effects produced by connection state transitions

use std::time::Duration;

/// Effects to be executed after a state transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new channel for the conversation (spawned, never blocks)
    OpenChannel { conversation_id: String },

    /// Close the current channel, or abandon an open in progress
    CloseChannel,

    /// Arm the reconnect timer
    ScheduleReconnect {
        conversation_id: String,
        delay: Duration,
        attempt: u32,
    },

    /// Disarm the reconnect timer
    CancelReconnect,

    /// Retry budget spent; no further attempt until the next bind
    ReportExhausted {
        conversation_id: String,
        attempts: u32,
        message: String,
    },

    /// Credential refused; retrying with it cannot succeed
    ReportRejected {
        conversation_id: String,
        message: String,
    },
}
