use crate::model::EventKind;

/// Failure to turn one wire envelope into a `NormalizedEvent`.
///
/// Decode failures are never fatal: the session logs and drops the envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Payload was not a JSON object.
    #[error("malformed {kind} envelope: {message}")]
    Malformed { kind: String, message: String },
    /// Event name is not one of the known event kinds.
    #[error("unknown event kind: {kind}")]
    UnknownKind { kind: String },
}

impl DecodeError {
    pub(crate) fn malformed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Transport-level failure of the live event stream.
///
/// Every variant drives the reconnect state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The stream could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The server answered the stream request with a non-success status.
    #[error("stream rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    /// Reading from an open stream failed.
    #[error("stream read failed: {0}")]
    Read(String),
    /// A single frame grew past the decoder's buffer limit.
    #[error("stream frame exceeded {limit} bytes")]
    FrameTooLarge { limit: usize },
    /// The server closed the stream without a terminal event.
    #[error("stream closed by server")]
    Closed,
}

/// Failure to fetch a full task snapshot.
///
/// Treated as "snapshot absent"; it never blocks retry scheduling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotFetchError {
    #[error("snapshot request failed: {0}")]
    Request(String),
    #[error("snapshot request returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("snapshot body could not be decoded: {0}")]
    Decode(String),
    #[error("snapshot request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Terminal outcome of a session that did not end in a clean completion.
///
/// Carried in the projected view rather than returned as an error, so the view
/// layer always renders it as state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum SessionFailure {
    /// The server reported the task as failed.
    #[error("task failed: {message}")]
    TerminalTask { message: String },
    /// Reconnection gave up; the user has to reload.
    #[error("connection lost after {attempts} attempts, reload to resume")]
    RetryExhausted { attempts: u32 },
}

/// Top-level error type for configuration and the task API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStreamError {
    /// Invalid client or session configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// The HTTP request could not be completed.
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success status.
    #[error("server returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    /// The response body did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<TaskStreamError> for SnapshotFetchError {
    fn from(value: TaskStreamError) -> Self {
        match value {
            TaskStreamError::Status { status, detail } => Self::Status { status, detail },
            TaskStreamError::Decode(message) => Self::Decode(message),
            other => Self::Request(other.to_string()),
        }
    }
}

/// Failure recorded alongside a server-reported `error` event.
pub(crate) fn failure_for(kind: EventKind, content: &str) -> Option<SessionFailure> {
    (kind == EventKind::Error).then(|| SessionFailure::TerminalTask {
        message: content.to_string(),
    })
}
