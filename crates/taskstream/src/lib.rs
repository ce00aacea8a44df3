//! Client-side reconciler for live task event streams.
//!
//! A task server reports progress of a long-running task over a Server-Sent
//! Events stream and also serves full task snapshots. This crate merges both
//! into one deduplicated, time-ordered view, reconnects with bounded retries
//! and reconciles against a snapshot whenever the stream breaks.
//!
//! # Watching a task
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use taskstream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TaskStreamError> {
//! taskstream::observability::init_observability();
//!
//! let client = Arc::new(HttpTaskClient::from_env()?);
//! let task_id = client.create_task("Find the cheapest flight to Lisbon").await?;
//!
//! let mut manager = SessionManager::new(client, SessionConfig::from_env()?)?;
//! let session = manager.start_session(task_id);
//!
//! let state = session.settled().await;
//! let view = session.view();
//! println!("{state}: {:?}", view.result.map(|r| r.content));
//! # Ok(())
//! # }
//! ```

/// Task backend contract used by the session manager.
pub mod backend;
/// Reconnect delay policies.
pub mod backoff;
/// HTTP client for the task server.
pub mod client;
/// Client and session configuration.
pub mod config;
/// Event fingerprints and the dedup ledger.
pub mod dedup;
/// Wire envelope decoding into normalized events.
pub mod envelope;
/// Public error types.
pub mod errors;
/// Task identifiers, event kinds and snapshot documents.
pub mod model;
/// Process-wide logging setup.
pub mod observability;
/// Timestamp ordering of display steps.
pub mod ordering;
/// Common imports for typical usage.
pub mod prelude;
/// Projection of events and snapshots into a task view.
pub mod projector;
/// Stream session lifecycle, retries and reconciliation.
pub mod session;
/// Server-Sent Events framing.
pub mod transport;

pub use backend::{EnvelopeStream, TaskBackend};
pub use backoff::BackoffPolicy;
pub use client::HttpTaskClient;
pub use config::{ClientConfig, SessionConfig};
pub use dedup::{DedupLedger, Fingerprint};
pub use envelope::{NormalizedEvent, RawEnvelope, StatusReport};
pub use errors::{DecodeError, SessionFailure, SnapshotFetchError, TaskStreamError, TransportError};
pub use model::{EventKind, SnapshotStep, TaskId, TaskSnapshot, TaskStatus, TokenUsage};
pub use ordering::{DisplayStep, OrderingBuffer};
pub use projector::{ResultSlot, TaskProjector, TaskView};
pub use session::{SessionHandle, SessionManager, SessionState};
