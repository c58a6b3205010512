//! Property-based tests for the connection state machine
//!
//! These tests verify key invariants hold across arbitrary event sequences.

use super::*;
use crate::transport::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

/// Apply an event, keeping the old state when the transition is rejected
fn step(state: &ConnState, event: Event) -> (ConnState, Vec<Effect>) {
    match transition(state, &ReconnectPolicy::default(), event) {
        Ok(result) => (result.new_state, result.effects),
        Err(_) => (state.clone(), vec![]),
    }
}

/// Follow any scheduled reconnect immediately
fn fire_timers(state: ConnState, effects: &[Effect]) -> (ConnState, Vec<Effect>) {
    let timer = effects.iter().find_map(|e| match e {
        Effect::ScheduleReconnect {
            conversation_id,
            attempt,
            ..
        } => Some(Event::RetryTimeout {
            conversation_id: conversation_id.clone(),
            attempt: *attempt,
        }),
        _ => None,
    });
    match timer {
        Some(event) => step(&state, event),
        None => (state, vec![]),
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_id() -> impl Strategy<Value = String> {
    prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
}

fn arb_failure() -> impl Strategy<Value = Event> {
    prop_oneof![
        "[a-z ]{0,12}".prop_map(|message| Event::ChannelOpenFailed { message }),
        "[a-z ]{0,12}".prop_map(|message| Event::ChannelError { message }),
        prop_oneof![Just(ABNORMAL_CLOSURE), Just(1001u16), Just(1005u16), Just(1011u16)]
            .prop_map(|code| Event::ChannelClosed {
                code,
                reason: String::new()
            }),
    ]
}

/// Failures that can hit an established channel
fn arb_drop() -> impl Strategy<Value = Event> {
    prop_oneof![
        "[a-z ]{0,12}".prop_map(|message| Event::ChannelError { message }),
        Just(Event::ChannelClosed {
            code: ABNORMAL_CLOSURE,
            reason: String::new()
        }),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        arb_id().prop_map(|conversation_id| Event::Bind { conversation_id }),
        Just(Event::Unbind),
        Just(Event::ChannelOpened),
        arb_failure(),
        Just(Event::ChannelClosed {
            code: NORMAL_CLOSURE,
            reason: "bye".into()
        }),
        (arb_id(), 0u32..8).prop_map(|(conversation_id, attempt)| Event::RetryTimeout {
            conversation_id,
            attempt
        }),
    ]
}

proptest! {
    /// Scheduled delays follow the backoff formula and stay within budget
    #[test]
    fn prop_reconnect_schedule_matches_policy(events in prop::collection::vec(arb_event(), 1..60)) {
        let policy = ReconnectPolicy::default();
        let mut state = ConnState::Disconnected;
        for event in events {
            let (next, effects) = step(&state, event);
            for effect in &effects {
                if let Effect::ScheduleReconnect { delay, attempt, .. } = effect {
                    prop_assert!(*attempt >= 1 && *attempt <= policy.max_attempts);
                    prop_assert_eq!(*delay, policy.delay_for(*attempt));
                    prop_assert!(*delay <= policy.cap);
                }
            }
            state = next;
        }
    }

    /// An open is always preceded by a close unless nothing was open
    #[test]
    fn prop_open_follows_teardown(events in prop::collection::vec(arb_event(), 1..60)) {
        let mut state = ConnState::Disconnected;
        for event in events {
            let had_channel = matches!(state, ConnState::Connecting { .. } | ConnState::Connected { .. });
            let is_bind = matches!(event, Event::Bind { .. });
            let (next, effects) = step(&state, event);
            if let Some(open) = effects.iter().position(|e| matches!(e, Effect::OpenChannel { .. })) {
                if had_channel || (is_bind && matches!(state, ConnState::Error { .. })) {
                    prop_assert_eq!(
                        &effects[..open],
                        &[Effect::CancelReconnect, Effect::CloseChannel][..]
                    );
                }
            }
            state = next;
        }
    }

    /// Unbind always lands in disconnected with no timer armed
    #[test]
    fn prop_unbind_always_disconnects(events in prop::collection::vec(arb_event(), 0..40)) {
        let mut state = ConnState::Disconnected;
        for event in events {
            state = step(&state, event).0;
        }
        let (state, effects) = step(&state, Event::Unbind);
        prop_assert_eq!(state, ConnState::Disconnected);
        let arms_channel = effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleReconnect { .. } | Effect::OpenChannel { .. }));
        prop_assert!(!arms_channel);
    }

    /// Consecutive failures allow exactly five retries, whatever the failure kind
    #[test]
    fn prop_retry_budget_is_bounded(failures in prop::collection::vec(arb_failure(), 12)) {
        let mut state = step(&ConnState::Disconnected, Event::bind("a")).0;
        let mut opens = 1;
        for failure in failures {
            if state == ConnState::Disconnected {
                break;
            }
            let (failed, failed_effects) = step(&state, failure);
            let reopened = failed_effects
                .iter()
                .any(|e| matches!(e, Effect::OpenChannel { .. }));
            prop_assert!(!reopened);
            let (next, retry_effects) = fire_timers(failed, &failed_effects);
            opens += retry_effects
                .iter()
                .filter(|e| matches!(e, Effect::OpenChannel { .. }))
                .count();
            state = next;
        }
        prop_assert_eq!(opens, 6);
        prop_assert_eq!(state, ConnState::Disconnected);
    }

    /// A successful open resets the failure count
    #[test]
    fn prop_connected_failure_starts_fresh(prior in 0u32..5, failure in arb_drop()) {
        let state = ConnState::Connecting { conversation_id: "a".into(), attempt: prior };
        let (connected, _) = step(&state, Event::ChannelOpened);
        let (failed, effects) = step(&connected, failure);
        let is_fresh = matches!(failed, ConnState::Error { attempt: 1, .. });
        prop_assert!(is_fresh);
        let first_retry = effects.iter().any(|e| matches!(e, Effect::ScheduleReconnect { attempt: 1, .. }));
        prop_assert!(first_retry);
    }
}
