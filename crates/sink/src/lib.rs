//! Point-to-point delivery of canonical events to the configured sink.
//!
//! The client reports exactly one attempt; retry policy belongs to the
//! orchestrator.

#![forbid(unsafe_code)]

use std::time::Duration;

use kubespout_core::{CanonicalEvent, CONTENT_TYPE_CLOUDEVENTS_JSON};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Connection refused, timeout, DNS failure – no response observed.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The sink answered with a non-2xx status.
    #[error("sink rejected event: status {status}")]
    Rejected { status: u16 },
}

impl SinkError {
    /// Response status, when one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            SinkError::Transport(_) => None,
            SinkError::Rejected { status } => Some(*status),
        }
    }
}

/// HTTP client POSTing serialized events to one sink URI.
pub struct SinkClient {
    client: reqwest::Client,
    uri: String,
}

impl SinkClient {
    /// Build a client with the default request/connect timeouts.
    pub fn new(uri: impl Into<String>) -> Result<Self, SinkError> {
        Self::with_timeouts(
            uri,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    pub fn with_timeouts(
        uri: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, uri: uri.into() })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Deliver one event: success is any 2xx response (body ignored).
    /// Exactly one attempt; the outcome is reported, never retried here.
    pub async fn deliver(&self, event: &CanonicalEvent) -> Result<u16, SinkError> {
        let response = self
            .client
            .post(&self.uri)
            .header(CONTENT_TYPE, CONTENT_TYPE_CLOUDEVENTS_JSON)
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(uri = %self.uri, status = %status, id = %event.id, "event delivered");
            Ok(status.as_u16())
        } else {
            Err(SinkError::Rejected { status: status.as_u16() })
        }
    }
}
