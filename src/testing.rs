//! Mock transports for testing
//!
//! These mocks let the connection manager and the reconciler run without
//! real sockets or HTTP.

use crate::transport::{
    Channel, ChannelEndpoint, ChannelListener, ChannelTransport, MemoryTokenProvider, Method,
    RequestTransport, TransportError,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use url::Url;

pub fn test_endpoint() -> ChannelEndpoint {
    ChannelEndpoint::new(
        Url::parse("ws://chat.test/api").unwrap(),
        "/chat/ws",
        Arc::new(MemoryTokenProvider::new(Some("test-token".into()))),
    )
}

// ============================================================================
// Mock channel transport
// ============================================================================

/// Outcome of one `open` call
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Succeed,
    Fail(String),
    /// Handshake refused the credential
    Reject(String),
}

/// Channel transport that records opens and hands out inspectable channels
#[derive(Default)]
pub struct MockChannelTransport {
    outcomes: Mutex<VecDeque<OpenOutcome>>,
    fail_all: Mutex<Option<String>>,
    opens: Mutex<Vec<(Instant, String)>>,
    listeners: Mutex<HashMap<u64, ChannelListener>>,
    channels: Mutex<HashMap<u64, Arc<MockChannel>>>,
    log: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl MockChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next open; opens succeed when nothing is queued
    pub fn queue_open(&self, outcome: OpenOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Make every open without a queued outcome fail
    pub fn fail_all_opens(&self, message: &str) {
        *self.fail_all.lock().unwrap() = Some(message.to_string());
    }

    pub fn open_instants(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
    }

    /// Open/close history, e.g. `["open a", "close 1", "open b"]`
    pub fn event_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Listener handed to the open of `channel_id`, to simulate server activity
    pub fn listener(&self, channel_id: u64) -> Option<ChannelListener> {
        self.listeners.lock().unwrap().get(&channel_id).cloned()
    }

    pub fn channel(&self, channel_id: u64) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().get(&channel_id).cloned()
    }

    /// Channels opened and not yet closed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn open(
        &self,
        url: &Url,
        listener: ChannelListener,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let channel_id = listener.channel_id();
        let conversation = url
            .query_pairs()
            .find(|(k, _)| k == "sessionId")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        self.opens
            .lock()
            .unwrap()
            .push((Instant::now(), url.to_string()));
        self.log.lock().unwrap().push(format!("open {conversation}"));
        self.listeners.lock().unwrap().insert(channel_id, listener);

        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| {
            match self.fail_all.lock().unwrap().clone() {
                Some(message) => OpenOutcome::Fail(message),
                None => OpenOutcome::Succeed,
            }
        });

        match outcome {
            OpenOutcome::Fail(message) => Err(TransportError::open(message)),
            OpenOutcome::Reject(message) => Err(TransportError::auth(message)),
            OpenOutcome::Succeed => {
                let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_live.fetch_max(live, Ordering::SeqCst);
                let channel = Arc::new(MockChannel {
                    id: channel_id,
                    sent: Mutex::new(Vec::new()),
                    closed: AtomicBool::new(false),
                    fail_sends: AtomicBool::new(false),
                    live: self.live.clone(),
                    log: self.log.clone(),
                });
                self.channels
                    .lock()
                    .unwrap()
                    .insert(channel_id, channel.clone());
                Ok(Box::new(channel))
            }
        }
    }
}

/// Channel that records frames instead of writing them
pub struct MockChannel {
    id: u64,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    live: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

impl Channel for Arc<MockChannel> {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::send("mock channel rejected the frame"));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("close {}", self.id));
        }
    }
}

// ============================================================================
// Mock request transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

enum MockResponse {
    Ready(Result<Value, TransportError>),
    /// Held until the gate is notified
    Gated(Result<Value, TransportError>, Arc<Notify>),
}

/// Request transport that returns queued responses in order
pub struct MockRequestTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    count: watch::Sender<usize>,
}

impl Default for MockRequestTransport {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            count: watch::Sender::new(0),
        }
    }
}

impl MockRequestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_ok(&self, body: Value) {
        self.push(MockResponse::Ready(Ok(body)));
    }

    pub fn queue_err(&self, error: TransportError) {
        self.push(MockResponse::Ready(Err(error)));
    }

    /// Queue a response that is only returned once the gate is notified
    pub fn queue_gated(&self, body: Value) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.push(MockResponse::Gated(Ok(body), gate.clone()));
        gate
    }

    fn push(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait until at least `n` requests have been issued
    pub async fn wait_for_requests(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl RequestTransport for MockRequestTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let response = self.responses.lock().unwrap().pop_front();
        let count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(RecordedRequest {
                method,
                path: path.to_string(),
                body,
            });
            requests.len()
        };
        self.count.send_replace(count);

        match response {
            Some(MockResponse::Ready(result)) => result,
            Some(MockResponse::Gated(result, gate)) => {
                gate.notified().await;
                result
            }
            None => Err(TransportError::request("No mock response queued")),
        }
    }
}
