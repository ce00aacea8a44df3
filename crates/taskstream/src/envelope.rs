//! Wire envelope decoding.
//!
//! Every event that reaches the projector, whether it came off the live
//! stream, out of a snapshot or was synthesized by the session, is a
//! `NormalizedEvent` produced here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::errors::DecodeError;
use crate::model::{EventKind, SnapshotStep, TaskStatus, TokenUsage, parse_timestamp};

/// Placeholder content for events that carry nothing displayable.
pub const NO_CONTENT: &str = "No content available";

/// One event exactly as received from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEnvelope {
    /// SSE event name (`message` when the frame had no `event:` line).
    pub event_kind: String,
    /// Raw `data:` payload, expected to be a JSON object.
    pub payload: String,
}

impl RawEnvelope {
    pub fn new(event_kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event_kind: event_kind.into(),
            payload: payload.into(),
        }
    }

    /// Decodes the envelope, stamping it with the current time as receipt time.
    pub fn decode(&self) -> Result<NormalizedEvent, DecodeError> {
        decode_at(&self.event_kind, &self.payload, Utc::now())
    }
}

/// Structured part of a `status` event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusReport {
    pub status: Option<TaskStatus>,
    /// Full step list the server embeds in status events.
    pub steps: Vec<SnapshotStep>,
    pub token_usage: Option<TokenUsage>,
    pub execution_time: Option<f64>,
}

/// A typed, normalized progress event.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    /// Never empty; falls back to [`NO_CONTENT`].
    pub content: String,
    pub step: Option<u64>,
    /// Server timestamp when present, otherwise `received_at`.
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status: Option<StatusReport>,
}

impl NormalizedEvent {
    /// Builds a locally synthesized event (retry notices, terminal markers).
    pub fn synthesized(
        kind: EventKind,
        content: impl Into<String>,
        step: Option<u64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            content: non_empty_or_placeholder(content.into()),
            step,
            occurred_at: at,
            received_at: at,
            status: None,
        }
    }

    /// Converts a snapshot step into an event sharing the live fingerprint space.
    ///
    /// Steps with an unknown `type` are skipped.
    pub fn from_snapshot_step(step: &SnapshotStep, received_at: DateTime<Utc>) -> Option<Self> {
        let Some(kind) = EventKind::from_wire(&step.kind) else {
            debug!(kind = %step.kind, "skipping snapshot step with unknown type");
            return None;
        };
        let occurred_at = step
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);
        Some(Self {
            kind,
            content: non_empty_or_placeholder(step.result.clone().unwrap_or_default()),
            step: step.step,
            occurred_at,
            received_at,
            status: None,
        })
    }
}

/// Decodes one envelope using the current time as receipt time.
pub fn decode(event_kind: &str, payload: &str) -> Result<NormalizedEvent, DecodeError> {
    decode_at(event_kind, payload, Utc::now())
}

/// Decodes one envelope with an explicit receipt time.
pub fn decode_at(
    event_kind: &str,
    payload: &str,
    received_at: DateTime<Utc>,
) -> Result<NormalizedEvent, DecodeError> {
    let kind = EventKind::from_wire(event_kind).ok_or_else(|| DecodeError::UnknownKind {
        kind: event_kind.to_string(),
    })?;
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| DecodeError::malformed(event_kind, format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(DecodeError::malformed(
            event_kind,
            "payload is not a JSON object",
        ));
    }

    let status = (kind == EventKind::Status).then(|| status_report(&value));
    let content = text_field(&value, "result")
        .or_else(|| text_field(&value, "message"))
        .or_else(|| {
            status.as_ref().and_then(|report| {
                report.status.as_ref().map(|s| {
                    format_status_line(s, report.token_usage.as_ref(), report.execution_time)
                })
            })
        })
        .unwrap_or_else(|| NO_CONTENT.to_string());

    let occurred_at = ["timestamp", "created_at"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str).and_then(parse_timestamp))
        .unwrap_or(received_at);

    Ok(NormalizedEvent {
        kind,
        content,
        step: value.get("step").and_then(Value::as_u64),
        occurred_at,
        received_at,
        status,
    })
}

/// Formats the one-line summary shown for `status` events.
///
/// Zero token counts and zero execution time are omitted.
pub fn format_status_line(
    status: &TaskStatus,
    token_usage: Option<&TokenUsage>,
    execution_time: Option<f64>,
) -> String {
    let mut line = format!("Status: {status}");
    if let Some(usage) = token_usage.filter(|usage| !usage.is_empty()) {
        line.push_str(&format!(
            " | Tokens: input {}, completion {}, total {}",
            usage.input, usage.completion, usage.total
        ));
    }
    if let Some(seconds) = execution_time.filter(|s| *s > 0.0) {
        line.push_str(&format!(" | Time: {seconds:.2}s"));
    }
    line
}

fn status_report(value: &Value) -> StatusReport {
    let steps = value
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<SnapshotStep>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    StatusReport {
        status: value
            .get("status")
            .and_then(Value::as_str)
            .map(TaskStatus::parse),
        steps,
        token_usage: value
            .get("token_usage")
            .and_then(|usage| serde_json::from_value(usage.clone()).ok()),
        execution_time: value.get("execution_time").and_then(Value::as_f64),
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn non_empty_or_placeholder(content: String) -> String {
    if content.trim().is_empty() {
        NO_CONTENT.to_string()
    } else {
        content
    }
}
