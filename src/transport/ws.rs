//! Websocket channel transport

use super::{Channel, ChannelListener, ChannelTransport, TokenProvider, TransportError};
use super::ABNORMAL_CLOSURE;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use url::Url;

/// Where channels are opened and how their URL is authenticated
#[derive(Clone)]
pub struct ChannelEndpoint {
    base: Url,
    path: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ChannelEndpoint {
    pub fn new(base: Url, path: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            base,
            path: path.into(),
            tokens,
        }
    }

    /// Channel URL for a conversation, carrying the bearer credential
    pub fn url_for(&self, conversation_id: &str) -> Result<Url, TransportError> {
        let joined = format!("{}{}", self.base.as_str().trim_end_matches('/'), self.path);
        let mut url = Url::parse(&joined)
            .map_err(|e| TransportError::open(format!("Invalid channel URL {joined}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sessionId", conversation_id);
            if let Some(token) = self.tokens.token() {
                query.append_pair("token", &token);
            }
        }
        Ok(url)
    }
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("base", &self.base.as_str())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Opens channels with tokio-tungstenite
#[derive(Clone)]
pub struct WsTransport {
    tokens: Arc<dyn TokenProvider>,
}

impl WsTransport {
    /// `tokens` is cleared when the handshake refuses the credential
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self { tokens }
    }

    fn open_error(&self, err: &tungstenite::Error) -> TransportError {
        match err {
            tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                self.tokens.clear();
                TransportError::auth("Channel credential rejected").with_status(401)
            }
            _ => TransportError::open(format!("Failed to open channel: {err}")),
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// Writer half of an open websocket; reads run on their own task
struct WsChannel {
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl Channel for WsChannel {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.out_tx
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::send("Channel writer has stopped"))
    }

    fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn open(
        &self,
        url: &Url,
        listener: ChannelListener,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| self.open_error(&e))?;
        let (mut sink, mut stream) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let channel_id = listener.channel_id();

        let writer_listener = listener.clone();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::warn!(channel_id, error = %e, "Channel write failed");
                            writer_listener.on_error(e.to_string());
                            break;
                        }
                    }
                    Outbound::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            tracing::debug!(channel_id, "Channel writer stopped");
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => listener.on_message(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or((1005, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_string())
                        });
                        tracing::debug!(channel_id, code, reason = %reason, "Channel closed by peer");
                        listener.on_close(code, reason);
                        return;
                    }
                    Ok(_) => {
                        // Ping/Pong/Binary - ignore
                    }
                    Err(e) => {
                        listener.on_error(e.to_string());
                        listener.on_close(ABNORMAL_CLOSURE, "read error");
                        return;
                    }
                }
            }
            listener.on_close(ABNORMAL_CLOSURE, "stream ended");
        });

        tracing::info!(channel_id, url = %redact(url), "Channel open");
        Ok(Box::new(WsChannel { out_tx }))
    }
}

/// URL for logs, without the credential
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    clean.query_pairs_mut().clear().extend_pairs(pairs);
    clean.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTokenProvider;

    #[test]
    fn test_url_carries_session_and_token() {
        let tokens = Arc::new(MemoryTokenProvider::new(Some("abc.def".into())));
        let endpoint = ChannelEndpoint::new(
            Url::parse("ws://localhost:8080/api").unwrap(),
            "/chat/ws",
            tokens,
        );
        let url = endpoint.url_for("s 1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8080/api/chat/ws?sessionId=s+1&token=abc.def"
        );
        assert_eq!(redact(&url), "ws://localhost:8080/api/chat/ws?sessionId=s+1");
    }

    #[test]
    fn test_handshake_401_clears_token() {
        let tokens = Arc::new(MemoryTokenProvider::new(Some("stale".into())));
        let transport = WsTransport::new(tokens.clone());
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();

        let err = transport.open_error(&tungstenite::Error::Http(response));
        assert!(err.is_auth());
        assert_eq!(err.status, Some(401));
        assert_eq!(tokens.token(), None);
    }

    #[test]
    fn test_other_handshake_failures_are_retryable() {
        let tokens = Arc::new(MemoryTokenProvider::new(Some("valid".into())));
        let transport = WsTransport::new(tokens.clone());
        let response = tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();

        let err = transport.open_error(&tungstenite::Error::Http(response));
        assert!(err.kind.is_retryable());
        assert_eq!(tokens.token().as_deref(), Some("valid"));

        let err = transport.open_error(&tungstenite::Error::ConnectionClosed);
        assert_eq!(err.kind, crate::transport::TransportErrorKind::Open);
    }

    #[test]
    fn test_url_without_token() {
        let endpoint = ChannelEndpoint::new(
            Url::parse("wss://chat.example.com/").unwrap(),
            "/chat/ws",
            Arc::new(MemoryTokenProvider::default()),
        );
        let url = endpoint.url_for("s-1").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/chat/ws?sessionId=s-1");
    }
}
