//! Client configuration from the environment

use crate::api::ApiPaths;
use crate::connection::ReconnectPolicy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not a valid URL: {message}")]
    InvalidUrl { var: &'static str, message: String },
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("Cannot derive a channel URL from scheme {0:?}; set PARLEY_WS_URL")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub token: Option<String>,
    pub http_timeout: Duration,
    pub status_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub paths: ApiPaths,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_url = parse_url(
            "PARLEY_API_URL",
            &get("PARLEY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        )?;
        let ws_url = match get("PARLEY_WS_URL") {
            Some(raw) => parse_url("PARLEY_WS_URL", &raw)?,
            None => derive_ws_url(&api_url)?,
        };

        let http_timeout = Duration::from_secs(parse_number(
            "PARLEY_HTTP_TIMEOUT_SECS",
            get("PARLEY_HTTP_TIMEOUT_SECS"),
            DEFAULT_HTTP_TIMEOUT_SECS,
        )?);
        let status_interval = Duration::from_millis(parse_number(
            "PARLEY_STATUS_INTERVAL_MS",
            get("PARLEY_STATUS_INTERVAL_MS"),
            DEFAULT_STATUS_INTERVAL_MS,
        )?);

        Ok(Self {
            api_url,
            ws_url,
            token: get("PARLEY_TOKEN"),
            http_timeout,
            status_interval,
            reconnect: ReconnectPolicy::default(),
            paths: ApiPaths::default(),
        })
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        message: e.to_string(),
    })
}

fn parse_number(var: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var, value: raw }),
    }
}

/// http → ws, https → wss, keeping host, port and path
fn derive_ws_url(api_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    let mut ws_url = api_url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|()| ConfigError::UnsupportedScheme(api_url.scheme().to_string()))?;
    Ok(ws_url)
}
