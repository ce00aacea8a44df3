use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque task identifier assigned by the server.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Creates a task id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the task id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Kind of a progress event, as named on the wire.
///
/// `Ping` is never received; it marks heartbeat steps synthesized locally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Think,
    Tool,
    Act,
    Log,
    Run,
    Message,
    Planning,
    Status,
    Step,
    Result,
    Complete,
    Error,
    Warning,
    Ping,
}

impl EventKind {
    /// Parses a wire event name. Returns `None` for unknown names and `ping`.
    pub fn from_wire(name: &str) -> Option<Self> {
        let kind = match name.trim() {
            "think" => Self::Think,
            "tool" => Self::Tool,
            "act" => Self::Act,
            "log" => Self::Log,
            "run" => Self::Run,
            "message" => Self::Message,
            "planning" => Self::Planning,
            "status" => Self::Status,
            "step" => Self::Step,
            "result" => Self::Result,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "warning" => Self::Warning,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Think => "think",
            Self::Tool => "tool",
            Self::Act => "act",
            Self::Log => "log",
            Self::Run => "run",
            Self::Message => "message",
            Self::Planning => "planning",
            Self::Status => "status",
            Self::Step => "step",
            Self::Result => "result",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Ping => "ping",
        }
    }

    /// Terminal kinds end the stream and are not step-indexed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Kinds whose content replaces the single result slot.
    pub fn is_panel_worthy(self) -> bool {
        matches!(
            self,
            Self::Tool | Self::Act | Self::Complete | Self::Error | Self::Result
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counters reported by the server.
///
/// Accepts both `{input, completion, total}` and
/// `{total_input_tokens, total_completion_tokens}` on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireTokenUsage")]
pub struct TokenUsage {
    pub input: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Deserialize)]
struct WireTokenUsage {
    #[serde(default)]
    input: Option<u64>,
    #[serde(default)]
    completion: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    total_input_tokens: Option<u64>,
    #[serde(default)]
    total_completion_tokens: Option<u64>,
}

impl From<WireTokenUsage> for TokenUsage {
    fn from(wire: WireTokenUsage) -> Self {
        let input = wire.input.or(wire.total_input_tokens).unwrap_or(0);
        let completion = wire.completion.or(wire.total_completion_tokens).unwrap_or(0);
        Self {
            input,
            completion,
            total: wire.total.unwrap_or(input.saturating_add(completion)),
        }
    }
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.completion == 0 && self.total == 0
    }
}

/// Server-side task status.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// `failed: <reason>` on the wire; the reason may be empty.
    Failed(String),
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => match trimmed.strip_prefix("failed") {
                Some(rest) => Self::Failed(rest.trim_start_matches(':').trim().to_string()),
                None => Self::Other(trimmed.to_string()),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) if reason.is_empty() => f.write_str("failed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.to_string()
    }
}

/// One step as recorded in a task snapshot (or embedded in a status event).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStep {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub step: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Full-state task document returned by `GET /tasks/{id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub steps: Vec<SnapshotStep>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub execution_time: Option<f64>,
}

impl TaskSnapshot {
    /// Result text of the last recorded step, if any.
    pub fn last_result(&self) -> Option<&str> {
        self.steps.last().and_then(|step| step.result.as_deref())
    }
}

/// Parses a server timestamp.
///
/// RFC 3339 first, then naive ISO-8601 (what the server's `isoformat()`
/// emits), interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
