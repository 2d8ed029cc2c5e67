//! Named-event translation
//!
//! The server wraps stage and content frames in envelopes that differ from
//! the unified chunk shape:
//!
//! | event     | payload                                               | chunk     |
//! |-----------|-------------------------------------------------------|-----------|
//! | `stage`   | `{stage: "label", status, message?, choices?}`        | stage     |
//! | `content` | `{choices?: [{delta: {content}}], content?}`          | content   |
//! | `message` | `"[DONE]"`, arbitrary JSON, or plain text             | any       |
//! | `done`    | ignored                                               | done      |
//! | `error`   | `{message, type?, status?}` or plain text             | error     |

use serde_json::Value;

use crate::chunk::{
    delta_content, str_field, Chunk, ChunkDecoder, DecodeError, DecodeMode, ErrorInfo,
    StageUpdate,
};

/// Error type given to server error frames that do not name one
pub const STREAM_ERROR: &str = "stream_error";

/// Translate one named frame into a chunk
///
/// `Ok(None)` means the frame carried nothing to apply.
///
/// # Errors
///
/// Returns a [`DecodeError`] only when `decoder` is strict.
pub fn translate(
    event: &str,
    data: &str,
    decoder: &ChunkDecoder,
) -> Result<Option<Chunk>, DecodeError> {
    match event {
        "content" => content_event(data, decoder),
        "stage" => stage_event(data, decoder),
        "done" => Ok(Some(Chunk::Done)),
        "error" => Ok(Some(Chunk::error(error_event(data)))),
        "message" | "" => decoder.decode_str(data),
        "open" => Ok(None),
        other => {
            tracing::debug!(event = other, "Unrecognized event name, decoding as message");
            decoder.decode_str(data)
        }
    }
}

fn parse(data: &str, decoder: &ChunkDecoder) -> Result<Option<Value>, DecodeError> {
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Ok(Some(value)),
        Err(e) if decoder.mode() == DecodeMode::Strict => Err(DecodeError::Malformed {
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn content_event(data: &str, decoder: &ChunkDecoder) -> Result<Option<Chunk>, DecodeError> {
    let Some(value) = parse(data, decoder)? else {
        // Not JSON: the frame body is the text
        return Ok(Some(Chunk::content(data)));
    };

    match value {
        Value::Object(object) if !object.contains_key("type") => {
            let seq = object.get("seq").and_then(Value::as_u64);
            if let Some(text) = str_field(&object, "content").or_else(|| delta_content(&object)) {
                return Ok(Some(Chunk::Content { text, seq }));
            }
            if object.contains_key("choices") {
                // Role-only or finish deltas carry no text
                return Ok(Some(Chunk::Content {
                    text: String::new(),
                    seq,
                }));
            }
            decoder.decode_value(Value::Object(object))
        }
        Value::String(text) => Ok(Some(Chunk::content(text))),
        other => decoder.decode_value(other),
    }
}

fn stage_event(data: &str, decoder: &ChunkDecoder) -> Result<Option<Chunk>, DecodeError> {
    let Some(value) = parse(data, decoder)? else {
        return Ok(Some(Chunk::stage(StageUpdate {
            label: data.trim().to_string(),
            ..StageUpdate::default()
        })));
    };

    match value {
        Value::Object(object) if object.get("type").and_then(Value::as_str) == Some("stage") => {
            decoder.decode_value(Value::Object(object))
        }
        Value::Object(object) => Ok(Some(Chunk::stage(StageUpdate::from_envelope(&object)))),
        Value::String(label) => Ok(Some(Chunk::stage(StageUpdate {
            label,
            ..StageUpdate::default()
        }))),
        other => decoder.decode_value(other),
    }
}

fn error_event(data: &str) -> ErrorInfo {
    let info = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(object)) => ErrorInfo::from_envelope(&object),
        Ok(Value::String(message)) => ErrorInfo::new(message),
        _ if data.trim().is_empty() => ErrorInfo::new("Stream error"),
        _ => ErrorInfo::new(data.trim()),
    };

    if info.kind.is_some() {
        info
    } else {
        info.with_kind(STREAM_ERROR)
    }
}
