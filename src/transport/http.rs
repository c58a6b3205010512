//! HTTP request transport

use super::{Method, RequestTransport, TokenProvider, TransportError};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// JSON-over-HTTP transport with bearer authentication
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpTransport {
    pub fn new(
        base_url: Url,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::request(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        join_path(&self.base_url, path)
    }
}

/// Append `path` (which may carry a query) to the base URL's path
fn join_path(base: &Url, path: &str) -> Result<Url, TransportError> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| TransportError::request(format!("Invalid URL {joined}: {e}")))
}

/// Fill in `success`/`message` when the server left them out
fn normalize_envelope(mut body: Value, status: StatusCode) -> Value {
    // Bare arrays/scalars are wrapped so callers always see an envelope
    if !body.is_object() {
        return json!({
            "success": status.is_success(),
            "data": body,
        });
    }

    if let Value::Object(map) = &mut body {
        map.entry("success")
            .or_insert_with(|| Value::Bool(status.is_success()));
        if !status.is_success() && !map.contains_key("message") {
            map.insert(
                "message".to_string(),
                json!(format!("Request failed: {status}")),
            );
        }
    }
    body
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let url = self.endpoint(path)?;
        tracing::debug!(method = %method, url = %url, "Sending request");

        let mut builder = self.client.request(method, url.clone());
        if let Some(token) = self.tokens.token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|e| {
            TransportError::request(format!("Unable to reach server: {e}"))
        })?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.clear();
            return Err(TransportError::auth("Authentication rejected").with_status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("application/json") {
            return Err(TransportError::request(format!(
                "Server returned a non-JSON response ({content_type}), status {status}, URL {url}"
            ))
            .with_status(status.as_u16()));
        }

        let value: Value = response.json().await.map_err(|e| {
            TransportError::request(format!("Invalid JSON response: {e}")).with_status(status.as_u16())
        })?;

        Ok(normalize_envelope(value, status))
    }
}
