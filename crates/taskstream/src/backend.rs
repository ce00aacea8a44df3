use std::pin::Pin;

use crate::envelope::RawEnvelope;
use crate::errors::{SnapshotFetchError, TransportError};
use crate::model::{TaskId, TaskSnapshot};

/// Live stream of raw envelopes for one task.
///
/// Dropping the stream closes the underlying connection.
pub type EnvelopeStream =
    Pin<Box<dyn futures::Stream<Item = Result<RawEnvelope, TransportError>> + Send + 'static>>;

/// Server-side operations the session manager depends on.
///
/// `HttpTaskClient` is the production implementation; tests script their own.
#[async_trait::async_trait]
pub trait TaskBackend: Send + Sync {
    /// Opens the server-push event stream for `task_id`.
    async fn open_stream(&self, task_id: &TaskId) -> Result<EnvelopeStream, TransportError>;

    /// Fetches the full task document.
    async fn fetch_snapshot(&self, task_id: &TaskId) -> Result<TaskSnapshot, SnapshotFetchError>;
}
