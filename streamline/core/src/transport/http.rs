//! HTTP event source
//!
//! Speaks `text/event-stream` over reqwest. Each connection is served by a
//! spawned task that forwards frames into the connection's channel until the
//! body ends, the stream breaks, the receiver goes away, or the connection
//! is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use reqwest::Client;
use tokio::sync::mpsc;

use super::traits::{CancelHandle, Connection, EventSource, SourceEvent, StreamRequest, TransportError};

/// Configuration for [`HttpEventSource`]
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Bound on establishing the TCP/TLS connection (not on the stream)
    pub connect_timeout: Duration,
    /// Buffered events per connection
    pub channel_capacity: usize,
    /// User-Agent header
    pub user_agent: String,
    /// Token used when a request carries none
    pub bearer_token: Option<String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 100,
            user_agent: format!("streamline/{}", env!("CARGO_PKG_VERSION")),
            bearer_token: None,
        }
    }
}

/// Event source backed by an HTTP client
#[derive(Clone, Debug)]
pub struct HttpEventSource {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpEventSource {
    /// Create a source with its own client
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the HTTP client cannot be built.
    pub fn new(config: HttpSourceConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Connect {
                message: format!("failed to build HTTP client: {e}"),
                status: None,
            })?;

        Ok(Self { client, config })
    }

    /// The source configuration
    #[must_use]
    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    fn build(&self, request: &StreamRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", request.url)))?;

        let mut builder = if request.payload.is_null() {
            self.client.get(url)
        } else {
            self.client.post(url).json(&request.payload)
        };

        builder = builder.header(ACCEPT, "text/event-stream");

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            builder = builder.header(name, value);
        }

        if let Some(token) = request
            .bearer_token
            .as_ref()
            .or(self.config.bearer_token.as_ref())
        {
            builder = builder.bearer_auth(token);
        }

        Ok(builder)
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &StreamRequest) -> Result<Connection, TransportError> {
        let builder = self.build(request)?;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancelHandle::new();

        let url = request.url.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = task_cancel.cancelled() => {
                    tracing::debug!(url = %url, "HTTP stream cancelled");
                }
                () = forward(builder, tx) => {
                    tracing::debug!(url = %url, "HTTP stream ended");
                }
            }
        });

        Ok(Connection::new(rx, cancel))
    }
}

async fn forward(builder: reqwest::RequestBuilder, tx: mpsc::Sender<SourceEvent>) {
    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "HTTP stream request failed");
            let _ = tx
                .send(SourceEvent::Error {
                    message: e.to_string(),
                    status: e.status().map(|s| s.as_u16()),
                })
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, "HTTP stream rejected");
        let message = if body.trim().is_empty() {
            format!("server returned {status}")
        } else {
            format!("server returned {status}: {}", body.trim())
        };
        let _ = tx
            .send(SourceEvent::Error {
                message,
                status: Some(status.as_u16()),
            })
            .await;
        return;
    }

    if tx.send(SourceEvent::Open).await.is_err() {
        return;
    }

    let mut stream = response.bytes_stream().eventsource();
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(sse) => SourceEvent::Frame {
                event: sse.event,
                data: sse.data,
            },
            Err(e) => {
                tracing::error!(error = %e, "HTTP stream broke");
                let _ = tx
                    .send(SourceEvent::Error {
                        message: e.to_string(),
                        status: None,
                    })
                    .await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            // Receiver dropped
            return;
        }
    }
}
