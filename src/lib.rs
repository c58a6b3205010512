//! Parley - realtime conversation client core
//!
//! A connection manager keeps one channel per conversation alive with
//! bounded reconnects, and a reconciler merges optimistic sends, server
//! pushes and request results into duplicate-free timelines.

pub mod api;
pub mod config;
pub mod connection;
pub mod hub;
pub mod model;
pub mod poller;
pub mod reconciler;
pub mod store;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use api::{ApiPaths, ChatApi};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionStatus, ReconnectPolicy};
pub use poller::StatusPoller;
pub use reconciler::{ChatError, Reconciler, SendOutcome, StoreEvent};
