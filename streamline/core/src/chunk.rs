//! Chunk Decoding
//!
//! A chunk is the wire-level unit pushed by the server. Every inbound payload
//! becomes exactly one of four variants: content, stage, error, or done.
//!
//! # Compatibility Rules
//!
//! The decoder is deliberately forgiving in [`DecodeMode::Lenient`]:
//!
//! - A payload that is not JSON becomes literal content text
//! - JSON without a recognized `type` becomes content, taking the first of
//!   `content`, `message`, or the JSON text itself
//! - An unknown `type` with a `content` field becomes content; otherwise the
//!   chunk is logged and dropped
//! - The literal `[DONE]` sentinel always means completion; a JSON string
//!   `"[DONE]"` is ordinary content text
//!
//! [`DecodeMode::Strict`] turns each fallback into a [`DecodeError`] so tests
//! can assert on malformed input instead of relying on the silent fallback.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::stage::{StageDetail, StageStatus};

/// Raw-text sentinel that marks the end of a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Error type attached to transport-level failures
pub const CONNECTION_ERROR: &str = "connection_error";

/// A decoded unit from the event stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    /// A piece of response text
    Content {
        /// Text to append to the active message
        #[serde(rename = "content")]
        text: String,
        /// Optional monotonic sequence number used for de-duplication
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// A progress stage update
    Stage {
        /// The stage being inserted or updated
        stage: StageUpdate,
    },
    /// An application or connection error
    Error {
        /// Error classification and message
        error: ErrorInfo,
    },
    /// The stream finished
    Done,
}

impl Chunk {
    /// Create a content chunk without a sequence number
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            text: text.into(),
            seq: None,
        }
    }

    /// Create a stage chunk
    #[must_use]
    pub fn stage(stage: StageUpdate) -> Self {
        Self::Stage { stage }
    }

    /// Create an error chunk
    #[must_use]
    pub fn error(error: ErrorInfo) -> Self {
        Self::Error { error }
    }

    /// Short name of the variant, matching the wire `type` field
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::Stage { .. } => "stage",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Whether this chunk ends the stream it belongs to
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }
}

/// A stage emission carried by a stage chunk
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageUpdate {
    /// Merge key; stages with the same label are updated in place
    #[serde(rename = "content", default)]
    pub label: String,
    /// Human-readable progress text
    #[serde(default)]
    pub message: String,
    /// Stage status (opaque values are kept verbatim)
    #[serde(default)]
    pub status: StageStatus,
    /// Structured detail, tagged by kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StageDetail>,
}

impl StageUpdate {
    /// Create a stage update with a label and message
    pub fn new(label: impl Into<String>, message: impl Into<String>, status: StageStatus) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
            status,
            detail: None,
        }
    }

    /// Attach structured detail
    #[must_use]
    pub fn with_detail(mut self, detail: StageDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Build a stage update from a JSON envelope
    ///
    /// Accepts both the unified shape (`{stage: {content, message, status, detail}}`)
    /// and the named-event shape (`{stage: "label", status, message?, choices?}`).
    #[must_use]
    pub fn from_envelope(object: &Map<String, Value>) -> Self {
        match object.get("stage") {
            Some(Value::Object(stage)) => Self::from_fields(stage, stage),
            Some(Value::String(label)) => {
                let mut update = Self::from_fields(object, object);
                update.label.clone_from(label);
                update
            }
            _ => Self::from_fields(object, object),
        }
    }

    fn from_fields(fields: &Map<String, Value>, outer: &Map<String, Value>) -> Self {
        let label = str_field(fields, "content")
            .or_else(|| str_field(fields, "label"))
            .unwrap_or_default();
        let message = str_field(fields, "message")
            .or_else(|| delta_content(outer))
            .unwrap_or_default();
        let status = fields
            .get("status")
            .map(StageStatus::from_value)
            .unwrap_or_default();
        let detail = fields.get("detail").and_then(StageDetail::from_value);

        Self {
            label,
            message,
            status,
            detail,
        }
    }
}

/// Error classification carried by an error chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable description
    pub message: String,
    /// Machine-readable error type (e.g. `rate_limit`, `connection_error`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// HTTP-style status code, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorInfo {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            status: None,
        }
    }

    /// Create a transport-level error
    pub fn connection(message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            kind: Some(CONNECTION_ERROR.to_string()),
            status,
        }
    }

    /// Set the error type
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the status code
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether this error came from the transport rather than the server
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        self.kind.as_deref() == Some(CONNECTION_ERROR)
    }

    /// Build error info from a JSON envelope
    ///
    /// Looks for a nested `error` object or string first, then falls back to
    /// top-level `message`/`type`/`status` fields.
    #[must_use]
    pub fn from_envelope(object: &Map<String, Value>) -> Self {
        match object.get("error") {
            Some(Value::Object(error)) => Self::from_fields(error, object),
            Some(Value::String(message)) => {
                let mut info = Self::from_fields(object, object);
                info.message.clone_from(message);
                info
            }
            _ => Self::from_fields(object, object),
        }
    }

    fn from_fields(fields: &Map<String, Value>, outer: &Map<String, Value>) -> Self {
        let message = str_field(fields, "message")
            .or_else(|| str_field(outer, "message"))
            .unwrap_or_else(|| "Unknown error".to_string());
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .filter(|kind| *kind != "error")
            .map(String::from)
            .or_else(|| str_field(fields, "error_type"));
        let status = fields
            .get("status")
            .or_else(|| fields.get("code"))
            .and_then(status_value);

        Self {
            message,
            kind,
            status,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, self.status) {
            (Some(kind), Some(status)) => write!(f, "{} ({kind}, {status})", self.message),
            (Some(kind), None) => write!(f, "{} ({kind})", self.message),
            (None, Some(status)) => write!(f, "{} ({status})", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Input accepted by the engine: an already-typed chunk or a raw payload
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkInput {
    /// A chunk that needs no decoding
    Chunk(Chunk),
    /// A raw payload string (JSON or plain text)
    Raw(String),
    /// An already-parsed JSON payload
    Json(Value),
}

impl From<Chunk> for ChunkInput {
    fn from(chunk: Chunk) -> Self {
        Self::Chunk(chunk)
    }
}

impl From<String> for ChunkInput {
    fn from(raw: String) -> Self {
        Self::Raw(raw)
    }
}

impl From<&str> for ChunkInput {
    fn from(raw: &str) -> Self {
        Self::Raw(raw.to_string())
    }
}

impl From<Value> for ChunkInput {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Decoding strictness
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// Fall back to plain content for anything unclassifiable (server-compatible default)
    #[default]
    Lenient,
    /// Report every fallback as a [`DecodeError`]
    Strict,
}

/// Errors raised by the decoder in strict mode
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not valid JSON
    #[error("payload is not valid JSON: {reason}")]
    Malformed {
        /// Parser error description
        reason: String,
    },

    /// Payload is JSON but carries no recognized `type` field
    #[error("payload has no recognized `type` field")]
    Untyped,

    /// Payload names an unknown chunk type
    #[error("unknown chunk type `{0}`")]
    UnknownType(String),

    /// A typed chunk lacks a field its type requires
    #[error("`{kind}` chunk is missing `{field}`")]
    InvalidShape {
        /// The chunk type
        kind: &'static str,
        /// The missing field
        field: &'static str,
    },
}

/// Decoder for raw chunk payloads
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkDecoder {
    mode: DecodeMode,
}

impl ChunkDecoder {
    /// Create a decoder with the given mode
    #[must_use]
    pub fn new(mode: DecodeMode) -> Self {
        Self { mode }
    }

    /// Create a lenient decoder
    #[must_use]
    pub fn lenient() -> Self {
        Self::new(DecodeMode::Lenient)
    }

    /// Create a strict decoder
    #[must_use]
    pub fn strict() -> Self {
        Self::new(DecodeMode::Strict)
    }

    /// The decoding mode
    #[must_use]
    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    fn is_strict(&self) -> bool {
        self.mode == DecodeMode::Strict
    }

    /// Decode any chunk input
    ///
    /// Returns `Ok(None)` when the payload was recognized as unusable and
    /// dropped (lenient mode only).
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] in strict mode when the payload would
    /// otherwise have been handled by a fallback rule.
    pub fn decode(&self, input: impl Into<ChunkInput>) -> Result<Option<Chunk>, DecodeError> {
        match input.into() {
            ChunkInput::Chunk(chunk) => Ok(Some(chunk)),
            ChunkInput::Raw(raw) => self.decode_str(&raw),
            ChunkInput::Json(value) => self.decode_value(value),
        }
    }

    /// Decode a raw payload string
    ///
    /// # Errors
    ///
    /// See [`ChunkDecoder::decode`].
    pub fn decode_str(&self, raw: &str) -> Result<Option<Chunk>, DecodeError> {
        if raw.trim() == DONE_SENTINEL {
            return Ok(Some(Chunk::Done));
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(object)) => self.decode_object(object),
            Ok(Value::String(text)) if !self.is_strict() => Ok(Some(Chunk::content(text))),
            Ok(_) if !self.is_strict() => Ok(Some(Chunk::content(raw))),
            Ok(_) => Err(DecodeError::Untyped),
            Err(e) => {
                if self.is_strict() {
                    return Err(DecodeError::Malformed {
                        reason: e.to_string(),
                    });
                }
                tracing::trace!(len = raw.len(), "Non-JSON payload, treating as plain text");
                Ok(Some(Chunk::content(raw)))
            }
        }
    }

    /// Decode an already-parsed JSON payload
    ///
    /// # Errors
    ///
    /// See [`ChunkDecoder::decode`].
    pub fn decode_value(&self, value: Value) -> Result<Option<Chunk>, DecodeError> {
        match value {
            Value::Object(object) => self.decode_object(object),
            Value::String(text) if !self.is_strict() => Ok(Some(Chunk::content(text))),
            other if !self.is_strict() => Ok(Some(Chunk::content(other.to_string()))),
            _ => Err(DecodeError::Untyped),
        }
    }

    fn decode_object(&self, object: Map<String, Value>) -> Result<Option<Chunk>, DecodeError> {
        let seq = object.get("seq").and_then(Value::as_u64);

        match object.get("type").and_then(Value::as_str) {
            Some("content") => {
                let text = str_field(&object, "content").or_else(|| delta_content(&object));
                match text {
                    Some(text) => Ok(Some(Chunk::Content { text, seq })),
                    None if self.is_strict() => Err(DecodeError::InvalidShape {
                        kind: "content",
                        field: "content",
                    }),
                    None => Ok(Some(Chunk::Content {
                        text: String::new(),
                        seq,
                    })),
                }
            }
            Some("stage") => {
                let has_stage = matches!(
                    object.get("stage"),
                    Some(Value::Object(_) | Value::String(_))
                );
                if self.is_strict() && !has_stage {
                    return Err(DecodeError::InvalidShape {
                        kind: "stage",
                        field: "stage",
                    });
                }
                Ok(Some(Chunk::stage(StageUpdate::from_envelope(&object))))
            }
            Some("error") => {
                if self.is_strict() && !has_error_message(&object) {
                    return Err(DecodeError::InvalidShape {
                        kind: "error",
                        field: "message",
                    });
                }
                Ok(Some(Chunk::error(ErrorInfo::from_envelope(&object))))
            }
            Some("done") => Ok(Some(Chunk::Done)),
            Some(other) => {
                if self.is_strict() {
                    return Err(DecodeError::UnknownType(other.to_string()));
                }
                if let Some(text) = str_field(&object, "content") {
                    tracing::debug!(chunk_type = other, "Unknown chunk type with content, treating as content");
                    return Ok(Some(Chunk::Content { text, seq }));
                }
                tracing::warn!(chunk_type = other, "Dropping chunk with unknown type");
                Ok(None)
            }
            None => {
                if self.is_strict() {
                    return Err(DecodeError::Untyped);
                }
                let text = str_field(&object, "content")
                    .or_else(|| str_field(&object, "message"))
                    .unwrap_or_else(|| Value::Object(object).to_string());
                Ok(Some(Chunk::Content { text, seq }))
            }
        }
    }
}

/// Whether an error envelope carries a message, nested or flat
fn has_error_message(object: &Map<String, Value>) -> bool {
    match object.get("error") {
        Some(Value::String(_)) => true,
        Some(Value::Object(error)) => error.get("message").is_some_and(Value::is_string),
        _ => object.get("message").is_some_and(Value::is_string),
    }
}

/// Read a string field from a JSON object
pub(crate) fn str_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(String::from)
}

/// Read `choices[0].delta.content` from an OpenAI-style envelope
pub(crate) fn delta_content(object: &Map<String, Value>) -> Option<String> {
    object
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(String::from)
}

fn status_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
