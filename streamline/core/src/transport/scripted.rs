//! Scripted event source
//!
//! Replays a fixed list of events on every `open`. Used by tests and for
//! feeding captured streams back through the engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{CancelHandle, Connection, EventSource, SourceEvent, StreamRequest, TransportError};

/// In-memory event source
#[derive(Debug, Default)]
pub struct ScriptedEventSource {
    script: Vec<SourceEvent>,
    failure: Option<TransportError>,
    keep_open: bool,
    opened: Mutex<Vec<StreamRequest>>,
    // Held so kept-open connections do not see the channel close
    senders: Mutex<Vec<mpsc::Sender<SourceEvent>>>,
}

impl ScriptedEventSource {
    /// Replay these events, then close
    #[must_use]
    pub fn new(script: Vec<SourceEvent>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Replay `Open` followed by the given `(event, data)` frames
    pub fn from_frames<I, E, D>(frames: I) -> Self
    where
        I: IntoIterator<Item = (E, D)>,
        E: Into<String>,
        D: Into<String>,
    {
        let script = std::iter::once(SourceEvent::Open)
            .chain(
                frames
                    .into_iter()
                    .map(|(event, data)| SourceEvent::frame(event, data)),
            )
            .collect();
        Self::new(script)
    }

    /// A source whose `open` always fails
    #[must_use]
    pub fn failing(error: TransportError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Keep connections open after the script is exhausted
    ///
    /// The connection then only ends when it is cancelled.
    #[must_use]
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Requests this source was opened with, in order
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.opened.lock().clone()
    }

    /// Number of times `open` was called
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl EventSource for ScriptedEventSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, request: &StreamRequest) -> Result<Connection, TransportError> {
        self.opened.lock().push(request.clone());

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let (tx, rx) = mpsc::channel(self.script.len().max(1));
        for event in &self.script {
            if tx.try_send(event.clone()).is_err() {
                return Err(TransportError::Closed);
            }
        }

        if self.keep_open {
            let mut senders = self.senders.lock();
            senders.retain(|sender| !sender.is_closed());
            senders.push(tx);
        }

        Ok(Connection::new(rx, CancelHandle::new()))
    }
}
