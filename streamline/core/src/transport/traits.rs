//! Event source abstraction

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

/// Request for opening an event stream
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    /// Endpoint URL
    pub url: String,
    /// JSON body; `Null` means no body (GET)
    pub payload: Value,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Bearer token for the `Authorization` header
    pub bearer_token: Option<String>,
}

impl StreamRequest {
    /// A POST request with a JSON body
    pub fn post(url: impl Into<String>, payload: Value) -> Self {
        Self {
            url: url.into(),
            payload,
            headers: Vec::new(),
            bearer_token: None,
        }
    }

    /// A GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::post(url, Value::Null)
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the bearer token
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Connection-level notification from an event source
///
/// The channel closing means the connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    /// The connection is established
    Open,
    /// One named frame
    Frame {
        /// Event name; empty for unnamed frames
        event: String,
        /// Raw payload
        data: String,
    },
    /// The connection failed
    Error {
        /// Description
        message: String,
        /// HTTP status, when known
        status: Option<u16>,
    },
}

impl SourceEvent {
    /// A named frame
    pub fn frame(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Frame {
            event: event.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable handle that severs a connection
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Create an un-cancelled handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the connection; idempotent
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether cancel has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the handle is cancelled
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// An open event stream
#[derive(Debug)]
pub struct Connection {
    events: mpsc::Receiver<SourceEvent>,
    cancel: CancelHandle,
}

impl Connection {
    /// Wrap a receiver and the handle that cancels its producer
    #[must_use]
    pub fn new(events: mpsc::Receiver<SourceEvent>, cancel: CancelHandle) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the connection is closed or cancelled
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Sever the connection
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }

    /// Handle for cancelling from elsewhere
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Whether the connection was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Consume as a `Stream` of events (cancellation still stops the producer)
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<SourceEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Capability to open an event stream
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Source name (for logging)
    fn name(&self) -> &str;

    /// Open a connection
    ///
    /// Failures after the connection is requested (refused, non-2xx, broken
    /// stream) are reported in-band as [`SourceEvent::Error`]; this only
    /// errors when the request cannot be attempted at all.
    async fn open(&self, request: &StreamRequest) -> Result<Connection, TransportError>;
}

/// Errors opening a connection
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request is unusable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The connection could not be established
    #[error("connection failed: {message}")]
    Connect {
        /// Description
        message: String,
        /// HTTP status, when known
        status: Option<u16>,
    },

    /// The source has no more connections to give
    #[error("event source closed")]
    Closed,
}

impl TransportError {
    /// HTTP status, when known
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Connect { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_after_cancel_returns_immediately() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_stops_after_cancel() {
        let (tx, rx) = mpsc::channel(4);
        let mut connection = Connection::new(rx, CancelHandle::new());
        tx.send(SourceEvent::Open).await.unwrap();
        tx.send(SourceEvent::frame("content", "x")).await.unwrap();

        assert_eq!(connection.next_event().await, Some(SourceEvent::Open));
        connection.cancel_handle().cancel();
        assert_eq!(connection.next_event().await, None);
    }

    #[tokio::test]
    async fn test_connection_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let mut connection = Connection::new(rx, CancelHandle::new());
        drop(tx);
        assert_eq!(connection.next_event().await, None);
        assert!(!connection.is_cancelled());
    }

    #[test]
    fn test_request_builder() {
        let request = StreamRequest::post("http://localhost/stream", serde_json::json!({"q": 1}))
            .with_header("X-Trace", "abc")
            .with_bearer_token("t0k");
        assert_eq!(request.headers, vec![("X-Trace".to_string(), "abc".to_string())]);
        assert_eq!(request.bearer_token.as_deref(), Some("t0k"));
        assert_eq!(StreamRequest::get("http://x").payload, Value::Null);
    }
}
