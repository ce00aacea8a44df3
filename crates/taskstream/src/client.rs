use serde_json::Value;
use tracing::debug;

use crate::backend::{EnvelopeStream, TaskBackend};
use crate::config::ClientConfig;
use crate::errors::{SnapshotFetchError, TaskStreamError, TransportError};
use crate::model::{TaskId, TaskSnapshot};
use crate::transport::{ByteStream, envelope_stream};

/// HTTP client for the task server.
///
/// Implements [`TaskBackend`] for the session manager and exposes the task
/// collection operations used by the surrounding views.
#[derive(Clone)]
pub struct HttpTaskClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTaskClient {
    /// Creates a client from explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self, TaskStreamError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("taskstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TaskStreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a client from `TASKSTREAM_*` environment variables.
    pub fn from_env() -> Result<Self, TaskStreamError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Submits a prompt and returns the new task's id.
    pub async fn create_task(&self, prompt: &str) -> Result<TaskId, TaskStreamError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(TaskStreamError::Validation(
                "prompt must not be empty".into(),
            ));
        }
        let response = self
            .client
            .post(self.config.tasks_url())
            .timeout(self.config.request_timeout)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| TaskStreamError::Request(format!("create task failed: {e}")))?;
        let body = read_success_body(response).await?;
        let task_id = body
            .get("task_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                TaskStreamError::Decode("create response does not contain task_id".into())
            })?;
        debug!(task_id, "task created");
        Ok(TaskId::new(task_id))
    }

    /// Lists all tasks, newest first as ordered by the server.
    ///
    /// A non-array body yields an empty list; malformed entries are skipped.
    pub async fn list_tasks(&self) -> Result<Vec<TaskSnapshot>, TaskStreamError> {
        let response = self
            .client
            .get(self.config.tasks_url())
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| TaskStreamError::Request(format!("list tasks failed: {e}")))?;
        let body = read_success_body(response).await?;
        let Value::Array(items) = body else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    /// Fetches one task document.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot, TaskStreamError> {
        let response = self
            .client
            .get(self.config.task_url(task_id.as_str()))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| TaskStreamError::Request(format!("get task failed: {e}")))?;
        let body = read_success_body(response).await?;
        serde_json::from_value(body)
            .map_err(|e| TaskStreamError::Decode(format!("invalid task document: {e}")))
    }

    pub async fn delete_task(&self, task_id: &TaskId) -> Result<(), TaskStreamError> {
        let response = self
            .client
            .delete(self.config.task_url(task_id.as_str()))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| TaskStreamError::Request(format!("delete task failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskStreamError::Status {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskBackend for HttpTaskClient {
    async fn open_stream(&self, task_id: &TaskId) -> Result<EnvelopeStream, TransportError> {
        debug!(task_id = %task_id, "opening task event stream");
        let response = self
            .client
            .get(self.config.events_url(task_id.as_str()))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: error_detail(&body),
            });
        }
        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(envelope_stream(bytes_stream))
    }

    async fn fetch_snapshot(&self, task_id: &TaskId) -> Result<TaskSnapshot, SnapshotFetchError> {
        Ok(self.get_task(task_id).await?)
    }
}

async fn read_success_body(response: reqwest::Response) -> Result<Value, TaskStreamError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| TaskStreamError::Request(format!("failed to read response body: {e}")))?;
    if !status.is_success() {
        return Err(TaskStreamError::Status {
            status: status.as_u16(),
            detail: error_detail(&text),
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| TaskStreamError::Decode(format!("response is not JSON: {e}")))
}

/// Extracts the server's `detail` or `message` from an error body.
pub(crate) fn error_detail(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    parsed
        .as_ref()
        .and_then(|value| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
        })
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| body.trim().to_string())
}
