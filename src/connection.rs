//! Connection lifecycle manager
//!
//! Implements the Elm Architecture pattern: a pure transition function over
//! [`ConnState`] produces effects, and a single actor task executes them.
//! The actor owns at most one channel and at most one reconnect timer.

mod effect;
mod event;
mod manager;
mod policy;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::Event;
pub use manager::{ConnectionManager, SendError};
pub use policy::ReconnectPolicy;
pub use state::{ConnState, ConnectionStatus};
pub use transition::{transition, TransitionError, TransitionResult};
