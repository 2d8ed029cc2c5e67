//! Progress Stages
//!
//! A stage is one named unit of progress within a streaming turn: a wallet
//! scan, a tool call, a reasoning step. The server re-emits the same stage
//! many times as progress advances; the ledger folds those emissions into a
//! stable, non-duplicating timeline keyed by label.
//!
//! # Ordering
//!
//! Stages keep first-seen order. Re-emitting label `A` after `B` updates `A`
//! in place and does not move it to the end.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::StageUpdate;

/// Unique identifier for one stage occurrence
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl StageId {
    /// Generate a new unique stage ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("stage_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage status
///
/// Serialized ordinally (`0`, `1`, `2`). Values the server sends outside that
/// set are kept verbatim in [`StageStatus::Unrecognized`] and left for the
/// consumer to interpret.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum StageStatus {
    /// Stage is running
    #[default]
    InProgress,
    /// Stage finished successfully
    Completed,
    /// Stage failed
    Error,
    /// A status value outside the known set
    Unrecognized(Value),
}

impl StageStatus {
    /// Interpret a wire value
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(0) => Self::InProgress,
                Some(1) => Self::Completed,
                Some(2) => Self::Error,
                _ => Self::Unrecognized(value.clone()),
            },
            Value::String(s) => match s.trim() {
                "0" | "in_progress" => Self::InProgress,
                "1" | "completed" => Self::Completed,
                "2" | "error" => Self::Error,
                _ => Self::Unrecognized(value.clone()),
            },
            Value::Null => Self::InProgress,
            other => Self::Unrecognized(other.clone()),
        }
    }

    /// Ordinal value, if the status is one of the known three
    #[must_use]
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            Self::InProgress => Some(0),
            Self::Completed => Some(1),
            Self::Error => Some(2),
            Self::Unrecognized(_) => None,
        }
    }

    /// Whether the stage has finished (successfully or not)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl From<Value> for StageStatus {
    fn from(value: Value) -> Self {
        Self::from_value(&value)
    }
}

impl From<StageStatus> for Value {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Unrecognized(value) => value,
            known => Value::from(known.ordinal().unwrap_or_default()),
        }
    }
}

impl From<u8> for StageStatus {
    fn from(ordinal: u8) -> Self {
        Self::from_value(&Value::from(ordinal))
    }
}

/// Structured stage detail, tagged with an explicit `kind`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDetail {
    /// Incremental progress through a batch
    Progress {
        /// Items processed so far
        current: u64,
        /// Total items
        total: u64,
        /// Item currently being processed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet: Option<String>,
        /// Whether the current item was flagged
        #[serde(default)]
        is_high_value: bool,
    },
    /// Summary at the end of a batch
    Completed {
        /// Number of flagged items
        #[serde(default)]
        high_value_count: u64,
        /// Total items
        #[serde(default)]
        total: u64,
        /// Items actually processed
        #[serde(default)]
        processed: u64,
    },
    /// A tool invocation
    ToolCall {
        /// Server hosting the tool
        #[serde(default)]
        server_name: String,
        /// Tool being called
        tool_name: String,
        /// Correlation id for the call
        #[serde(default)]
        call_id: String,
        /// Call arguments, passed through untouched
        #[serde(default)]
        arguments: Value,
    },
    /// Any other detail payload
    Other {
        /// The raw fields
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
}

impl StageDetail {
    /// Classify a raw detail payload
    ///
    /// An explicit `kind` field wins. Otherwise the shape is inferred once,
    /// in priority order: `tool_name` → tool call, `current` + `total` →
    /// progress, `high_value_count` or `processed` → completion summary,
    /// anything else → [`StageDetail::Other`]. Returns `None` for a null or
    /// non-object payload.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        if let Some(kind) = object.get("kind").and_then(Value::as_str) {
            if let Ok(detail) = serde_json::from_value::<Self>(value.clone()) {
                return Some(detail);
            }
            tracing::debug!(kind, "Stage detail kind did not match its fields, inferring");
        }

        Some(Self::infer(object))
    }

    fn infer(object: &Map<String, Value>) -> Self {
        if let Some(tool_name) = object.get("tool_name").and_then(Value::as_str) {
            return Self::ToolCall {
                server_name: text(object, "server_name"),
                tool_name: tool_name.to_string(),
                call_id: text(object, "call_id"),
                arguments: object.get("arguments").cloned().unwrap_or(Value::Null),
            };
        }

        if let (Some(current), Some(total)) = (number(object, "current"), number(object, "total")) {
            return Self::Progress {
                current,
                total,
                wallet: object.get("wallet").and_then(Value::as_str).map(String::from),
                is_high_value: object
                    .get("is_high_value")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
        }

        if object.contains_key("high_value_count") || object.contains_key("processed") {
            return Self::Completed {
                high_value_count: number(object, "high_value_count").unwrap_or(0),
                total: number(object, "total").unwrap_or(0),
                processed: number(object, "processed").unwrap_or(0),
            };
        }

        let mut fields = object.clone();
        fields.remove("kind");
        Self::Other { fields }
    }

    /// The `kind` tag for this detail
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::ToolCall { .. } => "tool_call",
            Self::Other { .. } => "other",
        }
    }
}

fn text(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// Counts arrive as numbers or numeric strings depending on the server path
fn number(object: &Map<String, Value>, key: &str) -> Option<u64> {
    match object.get(key)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A stage as held by the ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique id for this occurrence
    pub id: StageId,
    /// Label, used as the merge key
    pub content: String,
    /// Latest progress text
    pub message: String,
    /// Latest status
    pub status: StageStatus,
    /// Latest detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StageDetail>,
}

impl Stage {
    fn from_update(update: StageUpdate) -> Self {
        Self {
            id: StageId::new(),
            content: update.label,
            message: update.message,
            status: update.status,
            detail: update.detail,
        }
    }
}

/// Ordered, upsert-by-label collection of stages
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLedger {
    stages: Vec<Stage>,
}

impl StageLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new stage or update the existing stage with the same label
    ///
    /// An update replaces `message`, `status`, and `detail` wholesale. Stages
    /// with an empty label are anonymous and always appended.
    pub fn upsert(&mut self, update: StageUpdate) -> StageId {
        if !update.label.is_empty() {
            if let Some(existing) = self.stages.iter_mut().find(|s| s.content == update.label) {
                existing.message = update.message;
                existing.status = update.status;
                existing.detail = update.detail;

                tracing::trace!(stage = %existing.content, status = ?existing.status, "Stage updated");
                return existing.id.clone();
            }
        }

        let stage = Stage::from_update(update);
        let id = stage.id.clone();
        tracing::trace!(stage = %stage.content, "Stage added");
        self.stages.push(stage);
        id
    }

    /// Remove all stages
    pub fn clear(&mut self) {
        self.stages.clear();
    }

    /// Find a stage by its label
    #[must_use]
    pub fn get_by_label(&self, label: &str) -> Option<&Stage> {
        if label.is_empty() {
            return None;
        }
        self.stages.iter().find(|s| s.content == label)
    }

    /// Iterate stages in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the ledger is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Copy the stages out, in order
    #[must_use]
    pub fn to_vec(&self) -> Vec<Stage> {
        self.stages.clone()
    }
}
