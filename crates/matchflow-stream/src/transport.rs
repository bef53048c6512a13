//! Transport reader.
//!
//! Owns the outbound request lifecycle: one POST per session carrying the
//! matchup, a streamed `text/event-stream` response body, and typed errors
//! for everything that can go wrong before the first frame.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument};

use matchflow_core::Frame;

use crate::sse::{frame_stream, FrameStreamError};

/// Path of the simulation endpoint, relative to the configured base URL.
const SIMULATE_PATH: &str = "/simulate";

/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type alias for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Boxed stream of decoded frames (or parse/read failures).
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, FrameStreamError>> + Send>>;

/// Errors that can occur while monitoring a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// HTTP request failed (connect, timeout, TLS, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend returned a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error description parsed from the body.
        message: String,
    },

    /// Stream ended before a terminal frame arrived.
    #[error("stream closed unexpectedly")]
    UnexpectedClose,

    /// Session was cancelled by the caller.
    #[error("session cancelled")]
    Cancelled,
}

impl MonitorError {
    /// Error category string for diagnostics.
    #[must_use]
    pub fn category(&self) -> &str {
        match self {
            Self::Http(_) => "network",
            Self::Json(_) => "parse",
            Self::Api { .. } => "api",
            Self::UnexpectedClose => "closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Input parameters for one simulation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRequest {
    /// Home side name.
    pub home_team: String,
    /// Away side name.
    pub away_team: String,
}

/// Monitor configuration.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Base URL of the simulation backend.
    pub base_url: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl MonitorConfig {
    /// Configuration with default timeouts.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// HTTP transport for the simulation event stream.
pub struct StreamTransport {
    /// Configuration.
    config: MonitorConfig,
    /// HTTP client.
    client: reqwest::Client,
}

impl StreamTransport {
    /// Create a transport with its own HTTP client.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Create a transport with a shared HTTP client.
    #[must_use]
    pub fn with_client(config: MonitorConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Open the event stream for one simulation run.
    ///
    /// A non-success response status is an immediate terminal error; the
    /// body is parsed for an `error`/`message` field so the caller gets the
    /// backend's own words.
    #[instrument(skip_all, fields(home = %request.home_team, away = %request.away_team))]
    pub async fn open(&self, request: &SimulationRequest) -> MonitorResult<FrameStream> {
        let url = format!("{}{SIMULATE_PATH}", self.config.base_url);

        debug!(url = %url, "opening simulation stream");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(MonitorError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = parse_error_body(&body, status.as_u16());
            error!(status = status.as_u16(), message = %message, "simulation request rejected");
            return Err(MonitorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Box::pin(frame_stream(response.bytes_stream())))
    }
}

/// Parse an error response body, falling back to the raw text.
fn parse_error_body(body: &str, status: u16) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
    }
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
