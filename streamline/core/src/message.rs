//! Messages and the Accumulator State Machine
//!
//! ```text
//! pending ──(first content)──► streaming ──► completed
//!    │                             │
//!    └──────────────┬──────────────┘
//!                   ▼
//!                 error
//! ```
//!
//! Transitions are one-directional. A terminal message only becomes active
//! again when `start_stream` re-binds its id as a new turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::chunk::ErrorInfo;
use crate::session::SessionId;

/// Metadata key for the error classification
pub const ERROR_TYPE_KEY: &str = "errorType";

/// Metadata key for the error status code
pub const ERROR_STATUS_KEY: &str = "errorStatus";

/// Unique identifier for a message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who produced a message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human
    User,
    /// The model
    #[default]
    Assistant,
    /// System notices
    System,
}

/// Message lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Stream started, no content yet
    Pending,
    /// Content is arriving
    Streaming,
    /// Finished normally
    Completed,
    /// Finished with an error
    Error,
}

impl MessageStatus {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether the message occupies the active-stream slot
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        })
    }
}

/// Result of appending content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Text was appended
    Applied,
    /// Empty delta, nothing changed
    Empty,
    /// Sequence number already applied, chunk dropped
    Duplicate,
}

/// Rejected state transition
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The message is already terminal
    #[error("message {id} is already {status}")]
    Terminal {
        /// Message ID
        id: MessageId,
        /// Its terminal status
        status: MessageStatus,
    },
}

/// One utterance in a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Accumulated text
    pub content: String,
    /// Who produced it
    pub sender: MessageRole,
    /// Lifecycle status
    pub status: MessageStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Owning session
    pub session_id: SessionId,
    /// Open metadata; error classification is written on failure
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    last_seq: Option<u64>,
}

impl Message {
    /// Create a pending message at the start of a stream
    pub fn pending(
        id: MessageId,
        session_id: SessionId,
        sender: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            sender,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            session_id,
            metadata: Map::new(),
            last_seq: None,
        }
    }

    /// Create an already-completed message
    pub fn new(session_id: SessionId, sender: MessageRole, content: impl Into<String>) -> Self {
        let mut message = Self::pending(MessageId::new(), session_id, sender, content);
        message.status = MessageStatus::Completed;
        message
    }

    fn check_active(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Append a content delta
    ///
    /// When `seq` is given, deltas at or below the last applied sequence
    /// number are dropped as duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Terminal`] if the message is completed or failed.
    pub fn append_content(
        &mut self,
        text: &str,
        seq: Option<u64>,
    ) -> Result<AppendOutcome, TransitionError> {
        self.check_active()?;

        if let Some(seq) = seq {
            if self.last_seq.is_some_and(|last| seq <= last) {
                tracing::debug!(message_id = %self.id, seq, "Dropping duplicate content chunk");
                return Ok(AppendOutcome::Duplicate);
            }
            self.last_seq = Some(seq);
        }

        if text.is_empty() {
            return Ok(AppendOutcome::Empty);
        }

        self.content.push_str(text);
        if self.status == MessageStatus::Pending {
            self.status = MessageStatus::Streaming;
        }
        Ok(AppendOutcome::Applied)
    }

    /// Mark the message failed
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Terminal`] if the message is already terminal.
    pub fn fail(&mut self, error: &ErrorInfo) -> Result<(), TransitionError> {
        self.check_active()?;

        self.content = format!("Error: {}", error.message);
        self.status = MessageStatus::Error;
        self.metadata.insert(
            ERROR_TYPE_KEY.to_string(),
            Value::from(error.kind.clone().unwrap_or_else(|| "unknown".to_string())),
        );
        self.metadata.insert(
            ERROR_STATUS_KEY.to_string(),
            error.status.map_or(Value::Null, Value::from),
        );
        Ok(())
    }

    /// Mark the message completed; content is left unchanged
    ///
    /// Completing an already completed message is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Terminal`] if the message failed.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        if self.status == MessageStatus::Completed {
            return Ok(());
        }
        self.check_active()?;
        self.status = MessageStatus::Completed;
        Ok(())
    }

    /// Re-bind this message as a new pending turn
    pub(crate) fn reactivate(&mut self, content: String, sender: MessageRole) {
        self.content = content;
        self.sender = sender;
        self.status = MessageStatus::Pending;
        self.metadata.clear();
        self.last_seq = None;
    }

    /// Whether the message can still receive content
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Recorded error type, if the message failed
    #[must_use]
    pub fn error_type(&self) -> Option<&str> {
        self.metadata.get(ERROR_TYPE_KEY).and_then(Value::as_str)
    }

    /// Recorded error status, if the message failed with one
    #[must_use]
    pub fn error_status(&self) -> Option<u16> {
        self.metadata
            .get(ERROR_STATUS_KEY)
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }
}
