//! Transport capabilities used by the connection manager and the chat API
//!
//! The core never names a concrete protocol: the duplex channel and the
//! synchronous request path are traits so tests can substitute them.

mod auth;
mod error;
mod http;
mod ws;

pub use auth::{MemoryTokenProvider, TokenProvider};
pub use error::{TransportError, TransportErrorKind};
pub use http::HttpTransport;
pub use ws::{ChannelEndpoint, WsTransport};

pub use reqwest::Method;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Close code for a normal, intentional closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// What a live channel reports back to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Message(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Sink a transport reports channel activity into.
///
/// Each listener is tagged with the id of the channel it was created for,
/// so the owner can drop signals from channels it has already replaced.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    channel_id: u64,
    tx: mpsc::UnboundedSender<(u64, ChannelSignal)>,
}

impl ChannelListener {
    pub fn new(channel_id: u64, tx: mpsc::UnboundedSender<(u64, ChannelSignal)>) -> Self {
        Self { channel_id, tx }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn on_message(&self, text: impl Into<String>) {
        self.emit(ChannelSignal::Message(text.into()));
    }

    pub fn on_close(&self, code: u16, reason: impl Into<String>) {
        self.emit(ChannelSignal::Closed {
            code,
            reason: reason.into(),
        });
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.emit(ChannelSignal::Error(message.into()));
    }

    fn emit(&self, signal: ChannelSignal) {
        // The owner may already be gone; nothing left to notify
        let _ = self.tx.send((self.channel_id, signal));
    }
}

/// Opens duplex channels
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open a channel; activity is reported through `listener`
    async fn open(
        &self,
        url: &Url,
        listener: ChannelListener,
    ) -> Result<Box<dyn Channel>, TransportError>;
}

/// An open duplex channel
pub trait Channel: Send + Sync {
    /// Queue a text frame; never waits on the network
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close with the normal closure code
    fn close(&self);
}

/// One-shot request/response transport
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Issue a request; the response body is returned as JSON
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ChannelTransport + ?Sized> ChannelTransport for Arc<T> {
    async fn open(
        &self,
        url: &Url,
        listener: ChannelListener,
    ) -> Result<Box<dyn Channel>, TransportError> {
        (**self).open(url, listener).await
    }
}

#[async_trait]
impl<T: RequestTransport + ?Sized> RequestTransport for Arc<T> {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        (**self).request(method, path, body).await
    }
}

/// Logging wrapper for request transports
pub struct LoggingTransport<R> {
    inner: R,
}

impl<R: RequestTransport> LoggingTransport<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: RequestTransport> RequestTransport for LoggingTransport<R> {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let start = std::time::Instant::now();
        let result = self.inner.request(method.clone(), path, body).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => {
                tracing::info!(
                    method = %method,
                    path = %path,
                    duration_ms = %duration.as_millis(),
                    "Request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    method = %method,
                    path = %path,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "Request failed"
                );
            }
        }

        result
    }
}
