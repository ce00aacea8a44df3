use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::errors::TaskStreamError;

/// Configuration for the HTTP task client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the task server, without a trailing `/tasks`.
    pub base_url: String,
    /// Timeout for plain JSON requests (snapshot, list, create, delete).
    pub request_timeout: Duration,
    /// Connect timeout, also applied to the event stream.
    ///
    /// The stream itself has no total timeout; it stays open for the task's
    /// lifetime.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Builds a config from `TASKSTREAM_BASE_URL` and
    /// `TASKSTREAM_REQUEST_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self, TaskStreamError> {
        let mut config = match std::env::var("TASKSTREAM_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        };
        if let Some(ms) = env_parse::<u64>("TASKSTREAM_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), TaskStreamError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(TaskStreamError::Config("base_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TaskStreamError::Config(format!(
                "base_url must start with http:// or https://, got {url}"
            )));
        }
        Ok(())
    }

    pub(crate) fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url.trim().trim_end_matches('/'))
    }

    pub(crate) fn task_url(&self, task_id: &str) -> String {
        format!("{}/{}", self.tasks_url(), task_id)
    }

    pub(crate) fn events_url(&self, task_id: &str) -> String {
        format!("{}/events", self.task_url(task_id))
    }
}

/// Behavior of one stream session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Consecutive transport failures tolerated before giving up.
    ///
    /// Counts connection attempts, not retries: with `max_retries = N` the
    /// session shows `Retrying(1)` through `Retrying(N - 1)` and the N-th
    /// consecutive failure moves it to `Exhausted`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Idle time on a live stream before a heartbeat step is synthesized.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Upper bound for every snapshot fetch.
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Consecutive idle heartbeats before polling a snapshot. `None` disables
    /// stall polling.
    #[serde(default = "default_stall_poll_after")]
    pub stall_poll_after: Option<u32>,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_heartbeat_ms() -> u64 {
    5_000
}

const fn default_snapshot_timeout_ms() -> u64 {
    10_000
}

const fn default_stall_poll_after() -> Option<u32> {
    Some(3)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
            heartbeat_ms: default_heartbeat_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            stall_poll_after: default_stall_poll_after(),
        }
    }
}

impl SessionConfig {
    /// Applies `TASKSTREAM_MAX_RETRIES`, `TASKSTREAM_RETRY_DELAY_MS`,
    /// `TASKSTREAM_HEARTBEAT_MS` and `TASKSTREAM_SNAPSHOT_TIMEOUT_MS` on top of
    /// the defaults.
    pub fn from_env() -> Result<Self, TaskStreamError> {
        let mut config = Self::default();
        if let Some(max_retries) = env_parse("TASKSTREAM_MAX_RETRIES")? {
            config.max_retries = max_retries;
        }
        if let Some(delay_ms) = env_parse("TASKSTREAM_RETRY_DELAY_MS")? {
            config.backoff = BackoffPolicy::fixed(delay_ms);
        }
        if let Some(heartbeat_ms) = env_parse("TASKSTREAM_HEARTBEAT_MS")? {
            config.heartbeat_ms = heartbeat_ms;
        }
        if let Some(timeout_ms) = env_parse("TASKSTREAM_SNAPSHOT_TIMEOUT_MS")? {
            config.snapshot_timeout_ms = timeout_ms;
        }
        config.validate()?;
        Ok(config)
    }

    /// Total consecutive connection attempts before the session is exhausted.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_delay(self, delay: Duration) -> Self {
        self.backoff(BackoffPolicy::fixed(delay.as_millis() as u64))
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_ms = interval.as_millis() as u64;
        self
    }

    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stall_poll_after(mut self, idle_heartbeats: Option<u32>) -> Self {
        self.stall_poll_after = idle_heartbeats;
        self
    }

    pub fn validate(&self) -> Result<(), TaskStreamError> {
        if self.max_retries == 0 {
            return Err(TaskStreamError::Config(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.heartbeat_ms == 0 {
            return Err(TaskStreamError::Config(
                "heartbeat_ms must be greater than 0".into(),
            ));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(TaskStreamError::Config(
                "snapshot_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub(crate) fn snapshot_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, TaskStreamError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TaskStreamError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(None),
    }
}
