//! Session State
//!
//! A session groups one conversation's messages and stages. Each session owns
//! its own active-stream slot, so several sessions can stream at once inside
//! a single engine.
//!
//! The message list is append-only across streams; the stage ledger is reset
//! whenever a new stream starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ErrorInfo};
use crate::message::{AppendOutcome, Message, MessageId, MessageRole, TransitionError};
use crate::stage::{Stage, StageLedger};

/// Session used when the caller does not multiplex
pub const DEFAULT_SESSION: &str = "default";

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(DEFAULT_SESSION.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last error recorded for a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamFailure {
    /// Message the error terminated
    pub message_id: MessageId,
    /// The error
    pub error: ErrorInfo,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Optional seed for `start_stream`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitialMessage {
    /// Caller-supplied id; an existing id is re-activated
    pub id: Option<MessageId>,
    /// Initial content
    pub content: String,
    /// Sender role
    pub sender: MessageRole,
}

impl InitialMessage {
    /// Seed with a caller-supplied id
    pub fn with_id(id: impl Into<MessageId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Set initial content
    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the sender role
    #[must_use]
    pub fn sender(mut self, sender: MessageRole) -> Self {
        self.sender = sender;
        self
    }
}

/// Point-in-time copy of a session, handed to subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session ID
    pub session_id: SessionId,
    /// Messages in order
    pub messages: Vec<Message>,
    /// Stages in first-seen order
    pub stages: Vec<Stage>,
    /// Whether a stream is active
    pub is_streaming: bool,
    /// The active message, if any
    pub active_message_id: Option<MessageId>,
    /// Last recorded error
    pub last_error: Option<StreamFailure>,
}

impl SessionSnapshot {
    /// Find a message by id
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }
}

/// Mutable state for one session
#[derive(Clone, Debug)]
pub struct SessionState {
    id: SessionId,
    messages: Vec<Message>,
    stages: StageLedger,
    active_id: Option<MessageId>,
    last_error: Option<StreamFailure>,
    /// Maximum messages retained (0 = unlimited)
    max_messages: usize,
}

impl SessionState {
    /// Create an empty session
    #[must_use]
    pub fn new(id: SessionId, max_messages: usize) -> Self {
        Self {
            id,
            messages: Vec::new(),
            stages: StageLedger::new(),
            active_id: None,
            last_error: None,
            max_messages,
        }
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Messages in order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The stage ledger
    #[must_use]
    pub fn stages(&self) -> &StageLedger {
        &self.stages
    }

    /// The active message id
    #[must_use]
    pub fn active_id(&self) -> Option<&MessageId> {
        self.active_id.as_ref()
    }

    /// Last recorded error
    #[must_use]
    pub fn last_error(&self) -> Option<&StreamFailure> {
        self.last_error.as_ref()
    }

    /// Whether a stream is active
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active_id.is_some()
    }

    /// Find a message by id
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Start a new stream
    ///
    /// Creates a pending message (or re-activates an existing one when the
    /// initial message names a known id), resets the stage ledger and takes
    /// the active-stream slot. A previous non-terminal active message is left
    /// as it was.
    pub fn begin(&mut self, initial: Option<InitialMessage>) -> MessageId {
        let initial = initial.unwrap_or_default();

        if let Some(previous) = self.active_id.take() {
            if self.message(&previous).is_some_and(Message::is_active) {
                tracing::warn!(
                    session_id = %self.id,
                    superseded = %previous,
                    "Starting stream while previous stream is still active"
                );
            }
        }

        let id = initial.id.unwrap_or_default();
        if let Some(existing) = self.message_mut(&id) {
            existing.reactivate(initial.content, initial.sender);
            tracing::debug!(session_id = %self.id, message_id = %id, "Re-activated message");
        } else {
            self.messages.push(Message::pending(
                id.clone(),
                self.id.clone(),
                initial.sender,
                initial.content,
            ));
        }

        self.stages.clear();
        self.active_id = Some(id.clone());
        self.last_error = None;
        self.prune_if_needed();

        id
    }

    /// Resolve the message a chunk targets
    ///
    /// An explicit id wins; otherwise the active message is used.
    #[must_use]
    pub fn resolve(&self, explicit: Option<&MessageId>) -> Option<MessageId> {
        explicit.cloned().or_else(|| self.active_id.clone())
    }

    /// Apply a decoded chunk to a message
    ///
    /// Returns the error the chunk carried, if any, so the caller can emit it.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the target message is already terminal.
    /// A stage chunk never fails.
    pub fn apply(
        &mut self,
        target: &MessageId,
        chunk: Chunk,
    ) -> Result<Option<ErrorInfo>, TransitionError> {
        match chunk {
            Chunk::Stage { stage } => {
                self.stages.upsert(stage);
                Ok(None)
            }
            Chunk::Content { text, seq } => {
                if let Some(message) = self.message_mut(target) {
                    if message.append_content(&text, seq)? == AppendOutcome::Applied {
                        tracing::trace!(message_id = %target, len = text.len(), "Content appended");
                    }
                }
                Ok(None)
            }
            Chunk::Done => {
                if let Some(message) = self.message_mut(target) {
                    message.complete()?;
                }
                self.release(target);
                Ok(None)
            }
            Chunk::Error { error } => {
                if let Some(message) = self.message_mut(target) {
                    message.fail(&error)?;
                }
                self.release(target);
                self.last_error = Some(StreamFailure {
                    message_id: target.clone(),
                    error: error.clone(),
                    at: Utc::now(),
                });
                Ok(Some(error))
            }
        }
    }

    /// Free the active-stream slot if it is held by `id`
    pub fn release(&mut self, id: &MessageId) {
        if self.active_id.as_ref() == Some(id) {
            self.active_id = None;
        }
    }

    /// Append an already-completed message
    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.messages.push(message);
        self.prune_if_needed();
        id
    }

    /// Drop all messages and stages and reset the active-stream slot
    pub fn clear(&mut self) {
        self.messages.clear();
        self.stages.clear();
        self.active_id = None;
        self.last_error = None;
    }

    /// Copy current state for subscribers
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            messages: self.messages.clone(),
            stages: self.stages.to_vec(),
            is_streaming: self.is_streaming(),
            active_message_id: self.active_id.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn prune_if_needed(&mut self) {
        if self.max_messages == 0 || self.messages.len() <= self.max_messages {
            return;
        }

        let to_remove = self.messages.len() - self.max_messages;
        let active = self.active_id.clone();
        let mut removed = 0;

        self.messages.retain(|msg| {
            // Never remove the active message
            if Some(&msg.id) == active.as_ref() {
                return true;
            }
            if removed < to_remove {
                removed += 1;
                false
            } else {
                true
            }
        });

        tracing::debug!(
            session_id = %self.id,
            removed,
            remaining = self.messages.len(),
            "Pruned old messages"
        );
    }
}
