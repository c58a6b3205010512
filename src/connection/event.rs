//! Events that drive connection state transitions

/// Events fed into the connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // Caller commands
    Bind { conversation_id: String },
    Unbind,

    // Transport signals, already filtered to the current channel
    ChannelOpened,
    ChannelOpenFailed { message: String },
    /// The server refused the credential during the handshake
    ChannelRejected { message: String },
    ChannelClosed { code: u16, reason: String },
    ChannelError { message: String },

    // Timer
    RetryTimeout {
        conversation_id: String,
        attempt: u32,
    },
}

impl Event {
    pub fn bind(conversation_id: impl Into<String>) -> Self {
        Event::Bind {
            conversation_id: conversation_id.into(),
        }
    }
}
