//! Stream Engine - Session Manager
//!
//! Routes decoded chunks to the right session and message, and notifies
//! subscribers after every mutation.
//!
//! # Sessions
//!
//! The engine holds a map from [`SessionId`] to [`SessionState`]. Each
//! session has its own active-stream slot, so concurrent streams are just
//! different session ids on the same engine. Mutation of a session is
//! serialized by the map's per-shard lock; subscribers are notified while
//! that lock is held so events for one session arrive in mutation order.
//!
//! # Contract Errors
//!
//! Sending a chunk to a session with no active stream and no explicit message
//! id is a caller bug and returns [`EngineError::NoActiveStream`].

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chunk::{Chunk, ChunkDecoder, ChunkInput, DecodeError, DecodeMode, ErrorInfo};
use crate::message::{Message, MessageId, MessageRole, TransitionError};
use crate::session::{InitialMessage, SessionId, SessionSnapshot, SessionState, StreamFailure};
use crate::stage::Stage;
use crate::subscribers::{EngineEvent, SubscriberId, SubscriberRegistry};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the stream engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How raw payloads are decoded
    pub decode_mode: DecodeMode,
    /// Maximum messages retained per session (0 = unlimited)
    pub max_messages: usize,
    /// Buffer size for each subscriber channel
    pub event_capacity: usize,
    /// Session used by [`StreamEngine::default_session`]
    pub default_session: SessionId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decode_mode: DecodeMode::Lenient,
            max_messages: 0,
            event_capacity: 256,
            default_session: SessionId::default(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by engine operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No message id given and the session has no active stream
    #[error("no active stream in session {session}")]
    NoActiveStream {
        /// Session that was addressed
        session: SessionId,
    },

    /// The message id is not part of the session
    #[error("message {message} not found in session {session}")]
    UnknownMessage {
        /// Session that was addressed
        session: SessionId,
        /// Message that was addressed
        message: MessageId,
    },

    /// The chunk would move a terminal message
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Strict-mode decode failure
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}

// ============================================================================
// Engine
// ============================================================================

/// Multi-session streaming engine
///
/// All operations take `&self`; share the engine across tasks with `Arc`.
pub struct StreamEngine {
    sessions: DashMap<SessionId, SessionState>,
    decoder: ChunkDecoder,
    subscribers: SubscriberRegistry,
    config: EngineConfig,
}

impl StreamEngine {
    /// Create an engine with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with the given configuration
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            decoder: ChunkDecoder::new(config.decode_mode),
            subscribers: SubscriberRegistry::new(),
            config,
        }
    }

    /// The engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The decoder applied to raw payloads
    #[must_use]
    pub fn decoder(&self) -> &ChunkDecoder {
        &self.decoder
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<EngineEvent>) {
        self.subscribers.subscribe(self.config.event_capacity)
    }

    /// Stop receiving engine events
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Handle bound to one session
    #[must_use]
    pub fn session(&self, id: impl Into<SessionId>) -> SessionHandle<'_> {
        SessionHandle {
            engine: self,
            id: id.into(),
        }
    }

    /// Handle bound to the configured default session
    #[must_use]
    pub fn default_session(&self) -> SessionHandle<'_> {
        self.session(self.config.default_session.clone())
    }

    /// Broadcast a snapshot of `state`; returns whether one was built
    fn notify(&self, state: &SessionState) -> bool {
        if self.subscribers.is_empty() {
            return false;
        }
        self.subscribers
            .broadcast(&EngineEvent::Snapshot(state.snapshot()));
        true
    }

    /// Start a stream in a session
    ///
    /// Creates a pending message (or re-activates the id in `initial` if it is
    /// already known), clears the session's stages and marks it streaming.
    pub fn start_stream(&self, session: &SessionId, initial: Option<InitialMessage>) -> MessageId {
        let mut state = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionState::new(session.clone(), self.config.max_messages));

        let id = state.begin(initial);
        tracing::debug!(session_id = %session, message_id = %id, "Stream started");

        self.notify(&state);
        id
    }

    /// Decode and apply one chunk
    ///
    /// The chunk targets `message` if given, otherwise the session's active
    /// message. Content goes to the message, stages to the ledger, and
    /// `error`/`done` end the stream. An error chunk is also broadcast as
    /// [`EngineEvent::StreamError`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoActiveStream`] if no target can be resolved
    /// - [`EngineError::UnknownMessage`] if the target is not in the session
    /// - [`EngineError::Transition`] if the target is already terminal
    /// - [`EngineError::Decode`] in strict mode for malformed payloads
    pub fn process_chunk(
        &self,
        session: &SessionId,
        input: impl Into<ChunkInput>,
        message: Option<&MessageId>,
    ) -> Result<(), EngineError> {
        let decoded = self.decoder.decode(input)?;

        let mut state = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| EngineError::NoActiveStream {
                session: session.clone(),
            })?;

        let target = state
            .resolve(message)
            .ok_or_else(|| EngineError::NoActiveStream {
                session: session.clone(),
            })?;

        if state.message(&target).is_none() {
            return Err(EngineError::UnknownMessage {
                session: session.clone(),
                message: target,
            });
        }

        let Some(chunk) = decoded else {
            return Ok(());
        };

        tracing::trace!(session_id = %session, message_id = %target, chunk = chunk.kind(), "Processing chunk");
        let terminal = chunk.is_terminal();
        let failure = state.apply(&target, chunk)?;

        self.notify(&state);

        if let Some(error) = failure {
            tracing::warn!(session_id = %session, message_id = %target, error = %error, "Stream failed");
            self.subscribers.broadcast(&EngineEvent::StreamError {
                session_id: session.clone(),
                message_id: target,
                error,
            });
        } else if terminal {
            tracing::debug!(session_id = %session, message_id = %target, "Stream completed");
        }

        Ok(())
    }

    /// Finish a stream locally
    ///
    /// With an error this behaves like an `error` chunk, otherwise like
    /// `done`. Ending a stream that is already terminal, or a session with
    /// nothing to end, does nothing.
    ///
    /// This does not close the transport connection; pair it with
    /// [`crate::transport::CancelHandle::cancel`] when cancelling.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMessage`] if an explicit id is not part
    /// of the session.
    pub fn end_stream(
        &self,
        session: &SessionId,
        message: Option<&MessageId>,
        error: Option<ErrorInfo>,
    ) -> Result<(), EngineError> {
        let Some(mut state) = self.sessions.get_mut(session) else {
            tracing::debug!(session_id = %session, "end_stream on unknown session ignored");
            return Ok(());
        };

        let Some(target) = state.resolve(message) else {
            return Ok(());
        };

        let Some(current) = state.message(&target) else {
            return Err(EngineError::UnknownMessage {
                session: session.clone(),
                message: target,
            });
        };

        if !current.is_active() {
            state.release(&target);
            return Ok(());
        }

        let chunk = error.map_or(Chunk::Done, Chunk::error);
        let failure = state.apply(&target, chunk)?;
        tracing::debug!(session_id = %session, message_id = %target, failed = failure.is_some(), "Stream ended");

        self.notify(&state);

        if let Some(error) = failure {
            self.subscribers.broadcast(&EngineEvent::StreamError {
                session_id: session.clone(),
                message_id: target,
                error,
            });
        }

        Ok(())
    }

    /// Drop all messages and stages of a session
    pub fn clear(&self, session: &SessionId) {
        let Some(mut state) = self.sessions.get_mut(session) else {
            return;
        };

        state.clear();
        tracing::debug!(session_id = %session, "Session cleared");

        self.subscribers.broadcast(&EngineEvent::Cleared {
            session_id: session.clone(),
        });
        self.notify(&state);
    }

    /// Record a completed message that did not come from a stream
    pub fn push_message(
        &self,
        session: &SessionId,
        sender: MessageRole,
        content: impl Into<String>,
    ) -> MessageId {
        let mut state = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionState::new(session.clone(), self.config.max_messages));

        let id = state.push(Message::new(session.clone(), sender, content));
        self.notify(&state);
        id
    }

    /// Messages of a session, in order
    #[must_use]
    pub fn messages(&self, session: &SessionId) -> Vec<Message> {
        self.sessions
            .get(session)
            .map(|state| state.messages().to_vec())
            .unwrap_or_default()
    }

    /// Stages of a session, in first-seen order
    #[must_use]
    pub fn stages(&self, session: &SessionId) -> Vec<Stage> {
        self.sessions
            .get(session)
            .map(|state| state.stages().to_vec())
            .unwrap_or_default()
    }

    /// Whether a session has an active stream
    #[must_use]
    pub fn is_streaming(&self, session: &SessionId) -> bool {
        self.sessions
            .get(session)
            .is_some_and(|state| state.is_streaming())
    }

    /// Whether any session has an active stream
    #[must_use]
    pub fn is_any_streaming(&self) -> bool {
        self.sessions.iter().any(|entry| entry.is_streaming())
    }

    /// The active message of a session
    #[must_use]
    pub fn active_message_id(&self, session: &SessionId) -> Option<MessageId> {
        self.sessions
            .get(session)
            .and_then(|state| state.active_id().cloned())
    }

    /// The last error recorded in a session
    #[must_use]
    pub fn last_error(&self, session: &SessionId) -> Option<StreamFailure> {
        self.sessions
            .get(session)
            .and_then(|state| state.last_error().cloned())
    }

    /// Current state of a session
    ///
    /// An unknown session yields an empty snapshot.
    #[must_use]
    pub fn snapshot(&self, session: &SessionId) -> SessionSnapshot {
        match self.sessions.get(session) {
            Some(state) => state.snapshot(),
            None => SessionState::new(session.clone(), 0).snapshot(),
        }
    }

    /// Known sessions, sorted
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forget a session entirely
    pub fn remove_session(&self, session: &SessionId) -> bool {
        let removed = self.sessions.remove(session).is_some();
        if removed {
            tracing::debug!(session_id = %session, "Session removed");
        }
        removed
    }
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("sessions", &self.sessions.len())
            .field("subscribers", &self.subscribers)
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Session Handle
// ============================================================================

/// Engine operations bound to one session
#[derive(Clone, Debug)]
pub struct SessionHandle<'a> {
    engine: &'a StreamEngine,
    id: SessionId,
}

impl SessionHandle<'_> {
    /// The session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// See [`StreamEngine::start_stream`]
    pub fn start_stream(&self, initial: Option<InitialMessage>) -> MessageId {
        self.engine.start_stream(&self.id, initial)
    }

    /// See [`StreamEngine::process_chunk`]
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::process_chunk`].
    pub fn process_chunk(
        &self,
        input: impl Into<ChunkInput>,
        message: Option<&MessageId>,
    ) -> Result<(), EngineError> {
        self.engine.process_chunk(&self.id, input, message)
    }

    /// See [`StreamEngine::end_stream`]
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::end_stream`].
    pub fn end_stream(
        &self,
        message: Option<&MessageId>,
        error: Option<ErrorInfo>,
    ) -> Result<(), EngineError> {
        self.engine.end_stream(&self.id, message, error)
    }

    /// See [`StreamEngine::clear`]
    pub fn clear(&self) {
        self.engine.clear(&self.id);
    }

    /// See [`StreamEngine::push_message`]
    pub fn push_message(&self, sender: MessageRole, content: impl Into<String>) -> MessageId {
        self.engine.push_message(&self.id, sender, content)
    }

    /// See [`StreamEngine::messages`]
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.engine.messages(&self.id)
    }

    /// See [`StreamEngine::stages`]
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.engine.stages(&self.id)
    }

    /// See [`StreamEngine::is_streaming`]
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.engine.is_streaming(&self.id)
    }

    /// See [`StreamEngine::active_message_id`]
    #[must_use]
    pub fn active_message_id(&self) -> Option<MessageId> {
        self.engine.active_message_id(&self.id)
    }

    /// See [`StreamEngine::last_error`]
    #[must_use]
    pub fn last_error(&self) -> Option<StreamFailure> {
        self.engine.last_error(&self.id)
    }

    /// See [`StreamEngine::snapshot`]
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.engine.snapshot(&self.id)
    }
}
