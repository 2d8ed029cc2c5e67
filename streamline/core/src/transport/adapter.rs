//! Stream adapter
//!
//! Drives a [`Connection`]: demultiplexes its named frames through
//! [`envelope::translate`](super::envelope::translate) and hands every chunk
//! to a [`ChunkSink`]. Connection-level failures become `connection_error`
//! chunks and close the connection. Nothing is retried.

use super::envelope;
use super::traits::{Connection, EventSource, SourceEvent, StreamRequest, TransportError};
use crate::chunk::{Chunk, ChunkDecoder, ErrorInfo};
use crate::engine::StreamEngine;
use crate::message::MessageId;
use crate::session::{InitialMessage, SessionId};

/// Error type for frames the strict decoder rejected
pub const DECODE_ERROR: &str = "decode_error";

/// Receiver of decoded chunks
pub trait ChunkSink: Send {
    /// The connection is established
    fn on_open(&mut self) {}

    /// A decoded chunk, in arrival order
    fn on_chunk(&mut self, chunk: Chunk);

    /// The stream finished normally
    fn on_complete(&mut self) {}

    /// The stream finished with an error (after the error chunk was delivered)
    fn on_error(&mut self, _error: &ErrorInfo) {}
}

/// How a stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `done` arrived or the server closed cleanly
    Completed,
    /// An error chunk or a connection failure ended the stream
    Failed(ErrorInfo),
    /// The connection was cancelled locally
    Cancelled,
}

impl StreamOutcome {
    /// Whether the stream completed normally
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Couples an event source with the chunk decoder
///
/// Without an explicit decoder, [`drive`](Self::drive) decodes with the
/// engine's decoder and [`run`](Self::run)/[`pump`](Self::pump) decode
/// leniently.
#[derive(Debug)]
pub struct StreamAdapter<S> {
    source: S,
    decoder: Option<ChunkDecoder>,
}

impl<S: EventSource> StreamAdapter<S> {
    /// Create an adapter without an explicit decoder
    pub fn new(source: S) -> Self {
        Self {
            source,
            decoder: None,
        }
    }

    /// Use a specific decoder, also when driving an engine
    #[must_use]
    pub fn with_decoder(mut self, decoder: ChunkDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// The explicit decoder, if one was set
    #[must_use]
    pub fn decoder(&self) -> Option<&ChunkDecoder> {
        self.decoder.as_ref()
    }

    /// The underlying source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Open a connection
    ///
    /// # Errors
    ///
    /// Propagates the source's [`TransportError`].
    pub async fn open(&self, request: &StreamRequest) -> Result<Connection, TransportError> {
        tracing::debug!(source = self.source.name(), url = %request.url, "Opening stream");
        self.source.open(request).await
    }

    /// Open a connection and pump it to completion
    ///
    /// An open failure is reported to the sink as a `connection_error` chunk.
    pub async fn run<K: ChunkSink + ?Sized>(
        &self,
        request: &StreamRequest,
        sink: &mut K,
    ) -> StreamOutcome {
        self.run_with(request, sink, self.decoder.unwrap_or_default())
            .await
    }

    async fn run_with<K: ChunkSink + ?Sized>(
        &self,
        request: &StreamRequest,
        sink: &mut K,
        decoder: ChunkDecoder,
    ) -> StreamOutcome {
        match self.open(request).await {
            Ok(connection) => self.pump_with(connection, sink, decoder).await,
            Err(e) => {
                tracing::error!(source = self.source.name(), url = %request.url, error = %e, "Failed to open stream");
                let error = ErrorInfo::connection(e.to_string(), e.status());
                sink.on_chunk(Chunk::error(error.clone()));
                sink.on_error(&error);
                StreamOutcome::Failed(error)
            }
        }
    }

    /// Feed an open connection into a sink until it ends
    pub async fn pump<K: ChunkSink + ?Sized>(
        &self,
        connection: Connection,
        sink: &mut K,
    ) -> StreamOutcome {
        self.pump_with(connection, sink, self.decoder.unwrap_or_default())
            .await
    }

    async fn pump_with<K: ChunkSink + ?Sized>(
        &self,
        mut connection: Connection,
        sink: &mut K,
        decoder: ChunkDecoder,
    ) -> StreamOutcome {
        loop {
            let Some(event) = connection.next_event().await else {
                if connection.is_cancelled() {
                    tracing::debug!(source = self.source.name(), "Stream cancelled");
                    return StreamOutcome::Cancelled;
                }
                tracing::debug!(source = self.source.name(), "Stream closed by server");
                sink.on_complete();
                return StreamOutcome::Completed;
            };

            let chunk = match event {
                SourceEvent::Open => {
                    sink.on_open();
                    continue;
                }
                SourceEvent::Error { message, status } => {
                    tracing::warn!(source = self.source.name(), status = ?status, "Connection error: {message}");
                    return fail(&mut connection, sink, ErrorInfo::connection(message, status));
                }
                SourceEvent::Frame { event, data } => {
                    match envelope::translate(&event, &data, &decoder) {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!(event = %event, error = %e, "Rejected frame");
                            let error = ErrorInfo::new(e.to_string()).with_kind(DECODE_ERROR);
                            return fail(&mut connection, sink, error);
                        }
                    }
                }
            };

            match chunk {
                Chunk::Done => {
                    sink.on_chunk(Chunk::Done);
                    connection.close();
                    sink.on_complete();
                    return StreamOutcome::Completed;
                }
                Chunk::Error { error } => return fail(&mut connection, sink, error),
                chunk => sink.on_chunk(chunk),
            }
        }
    }

    /// Run one whole turn against an engine session
    ///
    /// Starts a stream, pumps the connection into it, and returns the message
    /// id with the outcome. A cancelled stream leaves the message as it was.
    /// Frames are decoded with the engine's decoder unless this adapter has
    /// its own.
    pub async fn drive(
        &self,
        engine: &StreamEngine,
        session: &SessionId,
        initial: Option<InitialMessage>,
        request: &StreamRequest,
    ) -> (MessageId, StreamOutcome) {
        let message_id = engine.start_stream(session, initial);
        let mut sink = EngineSink::new(engine, session.clone(), message_id.clone());
        let decoder = self.decoder.unwrap_or(*engine.decoder());
        let outcome = self.run_with(request, &mut sink, decoder).await;
        (message_id, outcome)
    }
}

fn fail<K: ChunkSink + ?Sized>(
    connection: &mut Connection,
    sink: &mut K,
    error: ErrorInfo,
) -> StreamOutcome {
    sink.on_chunk(Chunk::error(error.clone()));
    connection.close();
    sink.on_error(&error);
    StreamOutcome::Failed(error)
}

/// Sink that applies chunks to one message of an engine session
#[derive(Debug)]
pub struct EngineSink<'a> {
    engine: &'a StreamEngine,
    session_id: SessionId,
    message_id: MessageId,
}

impl<'a> EngineSink<'a> {
    /// Bind to a session and message
    #[must_use]
    pub fn new(engine: &'a StreamEngine, session_id: SessionId, message_id: MessageId) -> Self {
        Self {
            engine,
            session_id,
            message_id,
        }
    }

    /// The message chunks are applied to
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl ChunkSink for EngineSink<'_> {
    fn on_chunk(&mut self, chunk: Chunk) {
        if let Err(e) = self
            .engine
            .process_chunk(&self.session_id, chunk, Some(&self.message_id))
        {
            tracing::warn!(
                session_id = %self.session_id,
                message_id = %self.message_id,
                error = %e,
                "Chunk rejected by engine"
            );
        }
    }

    fn on_complete(&mut self) {
        if let Err(e) = self
            .engine
            .end_stream(&self.session_id, Some(&self.message_id), None)
        {
            tracing::warn!(message_id = %self.message_id, error = %e, "Failed to complete stream");
        }
    }
}
