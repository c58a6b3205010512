//! Connection actor and its handle

use super::{transition, ConnState, ConnectionStatus, Effect, Event, ReconnectPolicy};
use crate::hub::{HandlerId, Push, PushHub};
use crate::transport::{
    Channel, ChannelEndpoint, ChannelListener, ChannelSignal, ChannelTransport, TransportError,
};
use crate::wire::{parse_push, ClientFrame};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Why a channel send did not happen
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,
    #[error("Channel send failed: {0}")]
    Transport(#[from] TransportError),
}

enum Command {
    Dispatch {
        event: Event,
        ack: oneshot::Sender<()>,
    },
    Send {
        conversation_id: Option<String>,
        text: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Work produced by tasks the actor spawned
enum Internal {
    Ready {
        channel_id: u64,
        result: Result<Box<dyn Channel>, TransportError>,
    },
    Retry(Event),
}

/// Handle to the connection actor.
///
/// Cheap to clone; the actor stops when the last handle is dropped or
/// [`ConnectionManager::shutdown`] is called.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnState>,
    hub: Arc<PushHub>,
}

impl ConnectionManager {
    /// Start the actor on the current tokio runtime
    pub fn spawn<C>(transport: C, endpoint: ChannelEndpoint, policy: ReconnectPolicy) -> Self
    where
        C: ChannelTransport + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(PushHub::new());

        let runtime = ConnectionRuntime {
            transport: Arc::new(transport),
            endpoint,
            policy,
            state: ConnState::Disconnected,
            state_tx,
            hub: hub.clone(),
            commands_rx,
            signal_tx,
            signal_rx,
            internal_tx,
            internal_rx,
            channel: None,
            current_channel: None,
            next_channel_id: 0,
            opening: None,
            deferred_open: None,
            open_cancel: None,
            retry_cancel: None,
        };
        tokio::spawn(runtime.run());

        Self {
            commands: commands_tx,
            state_rx,
            hub,
        }
    }

    /// Bind to a conversation, replacing any existing channel.
    ///
    /// Returns once the state machine has processed the request; the
    /// channel itself opens in the background.
    pub async fn bind(&self, conversation_id: impl Into<String>) {
        self.dispatch(Event::bind(conversation_id)).await;
    }

    /// Close the channel and cancel any pending retry
    pub async fn unbind(&self) {
        self.dispatch(Event::Unbind).await;
    }

    async fn dispatch(&self, event: Event) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Dispatch { event, ack }).is_err() {
            tracing::debug!("Connection actor stopped, dropping command");
            return;
        }
        let _ = done.await;
    }

    /// Stream a frame over the open channel.
    ///
    /// Fails with [`SendError::NotConnected`] unless connected. A failed
    /// channel send is reported, never retried.
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), SendError> {
        self.send_text(None, frame.to_text()).await
    }

    /// Like [`send`](Self::send), but only if connected to `conversation_id`
    pub async fn send_to(&self, conversation_id: &str, frame: &ClientFrame) -> Result<(), SendError> {
        self.send_text(Some(conversation_id.to_string()), frame.to_text())
            .await
    }

    async fn send_text(&self, conversation_id: Option<String>, text: String) -> Result<(), SendError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                conversation_id,
                text,
                reply,
            })
            .map_err(|_| SendError::NotConnected)?;
        response.await.unwrap_or(Err(SendError::NotConnected))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state_rx.borrow().status()
    }

    pub fn state(&self) -> ConnState {
        self.state_rx.borrow().clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.state_rx.borrow().conversation_id().map(str::to_string)
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// Register a push handler; handlers run in registration order
    pub fn add_message_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        self.hub.subscribe(handler)
    }

    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Close the channel and stop the actor
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct ConnectionRuntime<C: ChannelTransport + 'static> {
    transport: Arc<C>,
    endpoint: ChannelEndpoint,
    policy: ReconnectPolicy,
    state: ConnState,
    state_tx: watch::Sender<ConnState>,
    hub: Arc<PushHub>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    signal_tx: mpsc::UnboundedSender<(u64, ChannelSignal)>,
    signal_rx: mpsc::UnboundedReceiver<(u64, ChannelSignal)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    /// The open channel, once the current open completed
    channel: Option<Box<dyn Channel>>,
    /// Id of the channel whose signals are accepted
    current_channel: Option<u64>,
    next_channel_id: u64,
    /// Channel whose open has not reported back yet, current or orphaned
    opening: Option<u64>,
    /// Open held back until the orphaned open reports and is closed
    deferred_open: Option<String>,
    /// Token to abandon an open in progress
    open_cancel: Option<CancellationToken>,
    /// Token to disarm the reconnect timer
    retry_cancel: Option<CancellationToken>,
}

impl<C: ChannelTransport + 'static> ConnectionRuntime<C> {
    async fn run(mut self) {
        tracing::debug!("Starting connection runtime");

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Dispatch { event, ack }) => {
                        self.process_event(event);
                        let _ = ack.send(());
                    }
                    Some(Command::Send { conversation_id, text, reply }) => {
                        let _ = reply.send(self.send(conversation_id.as_deref(), text));
                    }
                    Some(Command::Shutdown { ack }) => {
                        self.process_event(Event::Unbind);
                        self.drain_open().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.process_event(Event::Unbind);
                        self.drain_open().await;
                        break;
                    }
                },
                Some((channel_id, signal)) = self.signal_rx.recv() => {
                    if let Some(event) = self.on_signal(channel_id, signal) {
                        self.process_event(event);
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    let event = match internal {
                        Internal::Ready { channel_id, result } => self.on_channel_ready(channel_id, result),
                        Internal::Retry(event) => Some(event),
                    };
                    if let Some(event) = event {
                        self.process_event(event);
                    }
                }
            }
        }

        tracing::debug!("Connection runtime stopped");
    }

    /// Wait for an outstanding open to report and close what it produced
    async fn drain_open(&mut self) {
        while let Some(orphan) = self.opening {
            match self.internal_rx.recv().await {
                Some(Internal::Ready { channel_id, result }) => {
                    if channel_id == orphan {
                        self.opening = None;
                    }
                    if let Ok(channel) = result {
                        channel.close();
                    }
                }
                Some(Internal::Retry(_)) => {}
                None => break,
            }
        }
    }

    fn process_event(&mut self, event: Event) {
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            let result = match transition(&self.state, &self.policy, current_event) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring event");
                    continue;
                }
            };

            let old_state = std::mem::replace(&mut self.state, result.new_state);
            if old_state != self.state {
                log_transition(&old_state, &self.state);
                self.state_tx.send_replace(self.state.clone());
            }

            for effect in result.effects {
                if let Some(generated) = self.execute_effect(effect) {
                    events_to_process.push(generated);
                }
            }
        }
    }

    fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::OpenChannel { conversation_id } => self.open_channel(&conversation_id),

            Effect::CloseChannel => {
                if let Some(token) = self.open_cancel.take() {
                    token.cancel();
                }
                if let Some(channel) = self.channel.take() {
                    channel.close();
                }
                self.current_channel = None;
                self.deferred_open = None;
                None
            }

            Effect::ScheduleReconnect {
                conversation_id,
                delay,
                attempt,
            } => {
                tracing::warn!(
                    conv_id = %conversation_id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    "Scheduling reconnect"
                );
                if let Some(token) = self.retry_cancel.take() {
                    token.cancel();
                }
                let token = CancellationToken::new();
                self.retry_cancel = Some(token.clone());
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {
                            let _ = internal_tx.send(Internal::Retry(Event::RetryTimeout {
                                conversation_id,
                                attempt,
                            }));
                        }
                        () = token.cancelled() => {}
                    }
                });
                None
            }

            Effect::CancelReconnect => {
                if let Some(token) = self.retry_cancel.take() {
                    token.cancel();
                }
                None
            }

            Effect::ReportExhausted {
                conversation_id,
                attempts,
                message,
            } => {
                tracing::error!(
                    conv_id = %conversation_id,
                    attempts,
                    error = %message,
                    "Reconnect attempts exhausted, giving up"
                );
                None
            }

            Effect::ReportRejected {
                conversation_id,
                message,
            } => {
                tracing::error!(
                    conv_id = %conversation_id,
                    error = %message,
                    "Channel credential rejected, not retrying"
                );
                None
            }
        }
    }

    fn open_channel(&mut self, conversation_id: &str) -> Option<Event> {
        let url = match self.endpoint.url_for(conversation_id) {
            Ok(url) => url,
            Err(e) => {
                return Some(Event::ChannelOpenFailed { message: e.message });
            }
        };

        // An orphaned open may already hold a live channel; wait for it
        if let Some(orphan) = self.opening {
            tracing::debug!(conv_id = %conversation_id, orphan, "Deferring open until previous open reports");
            self.deferred_open = Some(conversation_id.to_string());
            return None;
        }

        self.next_channel_id += 1;
        let channel_id = self.next_channel_id;
        self.current_channel = Some(channel_id);
        self.opening = Some(channel_id);

        let listener = ChannelListener::new(channel_id, self.signal_tx.clone());
        let token = CancellationToken::new();
        self.open_cancel = Some(token.clone());
        let transport = self.transport.clone();
        let internal_tx = self.internal_tx.clone();

        tracing::debug!(conv_id = %conversation_id, channel_id, "Opening channel");
        tokio::spawn(async move {
            let result = tokio::select! {
                result = transport.open(&url, listener) => result,
                () = token.cancelled() => Err(TransportError::open("Open cancelled")),
            };
            let _ = internal_tx.send(Internal::Ready { channel_id, result });
        });
        None
    }

    fn on_channel_ready(
        &mut self,
        channel_id: u64,
        result: Result<Box<dyn Channel>, TransportError>,
    ) -> Option<Event> {
        if self.opening == Some(channel_id) {
            self.opening = None;
        }

        if self.current_channel != Some(channel_id) {
            // Replaced while opening
            if let Ok(channel) = result {
                channel.close();
            }
            return self
                .deferred_open
                .take()
                .and_then(|conversation_id| self.open_channel(&conversation_id));
        }
        self.open_cancel = None;

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                Some(Event::ChannelOpened)
            }
            Err(e) if e.is_auth() => Some(Event::ChannelRejected { message: e.message }),
            Err(e) => Some(Event::ChannelOpenFailed { message: e.message }),
        }
    }

    fn on_signal(&mut self, channel_id: u64, signal: ChannelSignal) -> Option<Event> {
        if self.current_channel != Some(channel_id) {
            tracing::debug!(channel_id, "Dropping signal from stale channel");
            return None;
        }

        match signal {
            ChannelSignal::Message(text) => {
                self.deliver(&text);
                None
            }
            ChannelSignal::Closed { code, reason } => Some(Event::ChannelClosed { code, reason }),
            ChannelSignal::Error(message) => Some(Event::ChannelError { message }),
        }
    }

    fn deliver(&self, text: &str) {
        let Some(conversation_id) = self.state.conversation_id() else {
            return;
        };
        match parse_push(text) {
            Ok(message) => {
                tracing::debug!(conv_id = %conversation_id, message_id = %message.id, "Push received");
                self.hub.publish(&Push {
                    conversation_id: conversation_id.to_string(),
                    message,
                });
            }
            Err(e) => {
                tracing::warn!(conv_id = %conversation_id, error = %e, "Dropping malformed push");
            }
        }
    }

    fn send(&self, conversation_id: Option<&str>, text: String) -> Result<(), SendError> {
        let bound = match (&self.state, conversation_id) {
            (ConnState::Connected { .. }, None) => true,
            (state, Some(id)) => state.is_connected_to(id),
            _ => false,
        };
        match &self.channel {
            Some(channel) if bound => channel.send(text).map_err(SendError::from),
            _ => Err(SendError::NotConnected),
        }
    }
}

fn log_transition(from: &ConnState, to: &ConnState) {
    let conv_id = to.conversation_id().or(from.conversation_id()).unwrap_or("-");
    let attempt = match to {
        ConnState::Connecting { attempt, .. } | ConnState::Error { attempt, .. } => *attempt,
        _ => 0,
    };
    if let ConnState::Error { message, .. } = to {
        tracing::warn!(
            conv_id = %conv_id,
            from = %from.status(),
            to = %to.status(),
            attempt,
            error = %message,
            "Connection state changed"
        );
    } else {
        tracing::info!(
            conv_id = %conv_id,
            from = %from.status(),
            to = %to.status(),
            attempt,
            "Connection state changed"
        );
    }
}
