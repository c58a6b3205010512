//! Pure state transition function

use super::{ConnState, Effect, Event, ReconnectPolicy};
use crate::transport::NORMAL_CLOSURE;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function.
///
/// Given the same inputs it always produces the same outputs; every side
/// effect is described by the returned effects.
pub fn transition(
    state: &ConnState,
    policy: &ReconnectPolicy,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Binding
        // ============================================================

        (ConnState::Disconnected, Event::Bind { conversation_id }) => {
            Ok(open_fresh(conversation_id, false))
        }

        // Already on (or heading to) this conversation
        (
            ConnState::Connecting {
                conversation_id: current,
                ..
            }
            | ConnState::Connected {
                conversation_id: current,
            },
            Event::Bind { conversation_id },
        ) if *current == conversation_id => Ok(TransitionResult::new(state.clone())),

        // Different id, or same id in error: tear down, then open with a fresh budget
        (
            ConnState::Connecting { .. } | ConnState::Connected { .. } | ConnState::Error { .. },
            Event::Bind { conversation_id },
        ) => Ok(open_fresh(conversation_id, true)),

        (ConnState::Disconnected, Event::Unbind) => Ok(TransitionResult::new(ConnState::Disconnected)),

        (_, Event::Unbind) => Ok(TransitionResult::new(ConnState::Disconnected)
            .with_effect(Effect::CancelReconnect)
            .with_effect(Effect::CloseChannel)),

        // ============================================================
        // Channel establishment
        // ============================================================

        (ConnState::Connecting { conversation_id, .. }, Event::ChannelOpened) => {
            Ok(TransitionResult::new(ConnState::Connected {
                conversation_id: conversation_id.clone(),
            }))
        }

        (
            ConnState::Connecting {
                conversation_id,
                attempt,
            },
            Event::ChannelOpenFailed { message } | Event::ChannelError { message },
        ) => Ok(fail(policy, conversation_id, *attempt, message)),

        (ConnState::Connecting { conversation_id, .. }, Event::ChannelRejected { message }) => {
            Ok(TransitionResult::new(ConnState::Disconnected)
                .with_effect(Effect::CloseChannel)
                .with_effect(Effect::ReportRejected {
                    conversation_id: conversation_id.clone(),
                    message,
                }))
        }

        // ============================================================
        // Closure
        // ============================================================

        (
            ConnState::Connecting { .. } | ConnState::Connected { .. },
            Event::ChannelClosed { code, .. },
        ) if code == NORMAL_CLOSURE => {
            Ok(TransitionResult::new(ConnState::Disconnected).with_effect(Effect::CloseChannel))
        }

        (
            ConnState::Connecting {
                conversation_id,
                attempt,
            },
            Event::ChannelClosed { code, reason },
        ) => Ok(fail(policy, conversation_id, *attempt, close_message(code, &reason))),

        // A healthy channel dropping starts a fresh retry budget
        (ConnState::Connected { conversation_id }, Event::ChannelClosed { code, reason }) => {
            Ok(fail(policy, conversation_id, 0, close_message(code, &reason)))
        }

        (ConnState::Connected { conversation_id }, Event::ChannelError { message }) => {
            Ok(fail(policy, conversation_id, 0, message))
        }

        // ============================================================
        // Reconnect timer
        // ============================================================

        (
            ConnState::Error {
                conversation_id,
                attempt,
                ..
            },
            Event::RetryTimeout {
                conversation_id: timer_id,
                attempt: timer_attempt,
            },
        ) if *conversation_id == timer_id && *attempt == timer_attempt => {
            Ok(TransitionResult::new(ConnState::Connecting {
                conversation_id: timer_id.clone(),
                attempt: timer_attempt,
            })
            .with_effect(Effect::OpenChannel {
                conversation_id: timer_id,
            }))
        }

        // Timer raced a cancellation
        (_, Event::RetryTimeout { .. }) => Ok(TransitionResult::new(state.clone())),

        // Late signals from the channel that just failed
        (
            ConnState::Error { .. },
            Event::ChannelClosed { .. } | Event::ChannelError { .. } | Event::ChannelOpenFailed { .. },
        ) => Ok(TransitionResult::new(state.clone())),

        // ============================================================
        // Invalid transitions
        // ============================================================

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {state:?} with event {event:?}"
        ))),
    }
}

fn open_fresh(conversation_id: String, teardown: bool) -> TransitionResult {
    let result = TransitionResult::new(ConnState::Connecting {
        conversation_id: conversation_id.clone(),
        attempt: 0,
    });
    let result = if teardown {
        result.with_effects([Effect::CancelReconnect, Effect::CloseChannel])
    } else {
        result
    };
    result.with_effect(Effect::OpenChannel { conversation_id })
}

/// Record a failed attempt; `failures` counts the failures before this one
fn fail(
    policy: &ReconnectPolicy,
    conversation_id: &str,
    failures: u32,
    message: String,
) -> TransitionResult {
    if policy.is_exhausted(failures) {
        return TransitionResult::new(ConnState::Disconnected)
            .with_effect(Effect::CloseChannel)
            .with_effect(Effect::ReportExhausted {
                conversation_id: conversation_id.to_string(),
                attempts: failures,
                message,
            });
    }

    let attempt = failures + 1;
    TransitionResult::new(ConnState::Error {
        conversation_id: conversation_id.to_string(),
        attempt,
        message,
    })
    .with_effect(Effect::CloseChannel)
    .with_effect(Effect::ScheduleReconnect {
        conversation_id: conversation_id.to_string(),
        delay: policy.delay_for(attempt),
        attempt,
    })
}

fn close_message(code: u16, reason: &str) -> String {
    if reason.is_empty() {
        format!("Channel closed (code {code})")
    } else {
        format!("Channel closed (code {code}): {reason}")
    }
}
