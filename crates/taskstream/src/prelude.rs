//! Common imports for typical reconciler usage.
pub use crate::{
    BackoffPolicy, ClientConfig, DisplayStep, EventKind, HttpTaskClient, ResultSlot,
    SessionConfig, SessionFailure, SessionHandle, SessionManager, SessionState, TaskBackend,
    TaskId, TaskStatus, TaskStreamError, TaskView,
};
