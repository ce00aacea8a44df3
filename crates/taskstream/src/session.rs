//! Stream session manager.
//!
//! One `SessionManager` drives at most one live connection. Each started
//! session runs as a single tokio task that owns the connection, the dedup
//! ledger (through the projector) and every timer, and multiplexes them with
//! `tokio::select!`. Handlers never run concurrently, so none of that state is
//! locked.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use taskstream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TaskStreamError> {
//! let client = Arc::new(HttpTaskClient::from_env()?);
//! let mut manager = SessionManager::new(client, SessionConfig::default())?;
//! let mut session = manager.start_session("3f1c2a");
//!
//! while let Some(state) = session.next_state_change().await {
//!     println!("{state}: {} steps", session.view().steps.len());
//!     if state.is_settled() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{EnvelopeStream, TaskBackend};
use crate::config::SessionConfig;
use crate::dedup::DedupLedger;
use crate::envelope::{NormalizedEvent, RawEnvelope};
use crate::errors::{
    SessionFailure, SnapshotFetchError, TaskStreamError, TransportError, failure_for,
};
use crate::model::{EventKind, TaskId, TaskSnapshot, TaskStatus};
use crate::projector::{Applied, TaskProjector, TaskView};

/// Terminal step appended when reconnection gives up.
pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost, please refresh the page";

/// Terminal step appended when a snapshot reports completion.
pub const TASK_COMPLETED_MESSAGE: &str = "Task completed";

/// Lifecycle of one stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
    /// Waiting to reconnect after the n-th consecutive failure.
    Retrying(u32),
    Exhausted,
    Closed,
}

impl SessionState {
    /// `Exhausted` and `Closed` end stream-driven updates.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed)
    }

    fn accepts(&self, next: SessionState) -> bool {
        match self {
            Self::Closed => false,
            Self::Exhausted => next == Self::Closed,
            current => *current != next,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Live => f.write_str("live"),
            Self::Retrying(attempt) => write!(f, "retrying ({attempt})"),
            Self::Exhausted => f.write_str("exhausted"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Publishes state transitions to the watch cell and, in the same order, to
/// the change feed.
struct StatePublisher {
    cell: watch::Sender<SessionState>,
    changes: mpsc::UnboundedSender<SessionState>,
}

impl StatePublisher {
    fn transition(&self, next: SessionState) -> bool {
        self.cell.send_if_modified(|current| {
            if !current.accepts(next) {
                return false;
            }
            *current = next;
            let _ = self.changes.send(next);
            true
        })
    }

    fn current(&self) -> SessionState {
        *self.cell.borrow()
    }
}

/// Observer side of one started session.
pub struct SessionHandle {
    task_id: TaskId,
    session_id: uuid::Uuid,
    view: watch::Receiver<TaskView>,
    state: watch::Receiver<SessionState>,
    changes: mpsc::UnboundedReceiver<SessionState>,
}

impl SessionHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Current projected view.
    pub fn view(&self) -> TaskView {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that is notified on every projected change.
    pub fn subscribe_view(&self) -> watch::Receiver<TaskView> {
        self.view.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Next state transition, in order.
    ///
    /// Returns `None` only after the manager has dropped the session (stopped,
    /// replaced or dropped itself) and every transition was delivered. A
    /// session that settled on its own stays attached to its manager, so
    /// callers should stop once a state `is_settled()`.
    pub async fn next_state_change(&mut self) -> Option<SessionState> {
        self.changes.recv().await
    }

    /// Waits until the session is `Exhausted` or `Closed`.
    pub async fn settled(&self) -> SessionState {
        let mut state = self.state.clone();
        if let Ok(settled) = state.wait_for(SessionState::is_settled).await {
            return *settled;
        }
        let current = *state.borrow();
        current
    }
}

struct ActiveSession {
    task_id: TaskId,
    session_id: uuid::Uuid,
    stop_tx: watch::Sender<bool>,
    publisher: Arc<StatePublisher>,
    join: JoinHandle<()>,
}

impl ActiveSession {
    fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        self.join.abort();
        if self.publisher.transition(SessionState::Closed) {
            info!(task_id = %self.task_id, session_id = %self.session_id, "task stream session stopped");
        }
    }
}

/// Owns the single live task session of one task view.
pub struct SessionManager {
    backend: Arc<dyn TaskBackend>,
    config: SessionConfig,
    active: Option<ActiveSession>,
}

impl SessionManager {
    /// Creates a manager after validating `config`.
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        config: SessionConfig,
    ) -> Result<Self, TaskStreamError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            active: None,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts streaming `task_id`, replacing any previous session.
    ///
    /// The previous connection is closed and its ledger discarded before the
    /// new session starts. Must be called from within a tokio runtime.
    pub fn start_session(&mut self, task_id: impl Into<TaskId>) -> SessionHandle {
        self.stop();

        let task_id = task_id.into();
        let session_id = uuid::Uuid::new_v4();
        let (view_tx, view_rx) = watch::channel(TaskView::empty(task_id.clone()));
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let publisher = Arc::new(StatePublisher {
            cell: state_tx,
            changes: changes_tx,
        });
        publisher.transition(SessionState::Connecting);
        info!(task_id = %task_id, session_id = %session_id, "starting task stream session");

        let driver = SessionDriver {
            task_id: task_id.clone(),
            session_id,
            backend: self.backend.clone(),
            config: self.config.clone(),
            projector: TaskProjector::new(task_id.clone(), DedupLedger::new()),
            publisher: publisher.clone(),
            view_tx,
            stop_rx,
            failures: 0,
            retries: 0,
        };
        let join = tokio::spawn(driver.run());

        self.active = Some(ActiveSession {
            task_id: task_id.clone(),
            session_id,
            stop_tx,
            publisher,
            join,
        });

        SessionHandle {
            task_id,
            session_id,
            view: view_rx,
            state: state_rx,
            changes: changes_rx,
        }
    }

    /// Closes the active connection and cancels its retry and heartbeat timers.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
    }

    /// State of the active session, `Idle` when none was started.
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map_or(SessionState::Idle, |active| active.publisher.current())
    }

    pub fn active_task(&self) -> Option<&TaskId> {
        self.active.as_ref().map(|active| &active.task_id)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

enum PumpExit {
    Disconnected(TransportError),
    Finished,
}

enum Recovery {
    Reconnect,
    Finished,
}

struct SessionDriver {
    task_id: TaskId,
    session_id: uuid::Uuid,
    backend: Arc<dyn TaskBackend>,
    config: SessionConfig,
    projector: TaskProjector,
    publisher: Arc<StatePublisher>,
    view_tx: watch::Sender<TaskView>,
    stop_rx: watch::Receiver<bool>,
    failures: u32,
    /// Retries scheduled over the whole session; never reset.
    retries: u64,
}

impl SessionDriver {
    async fn run(mut self) {
        let timeout = self.config.snapshot_timeout_duration();
        let backend = self.backend.clone();
        let task_id = self.task_id.clone();
        let initial = until_stopped(&mut self.stop_rx, async move {
            tokio::join!(
                backend.open_stream(&task_id),
                fetch_snapshot_bounded(backend.as_ref(), &task_id, timeout),
            )
        })
        .await;
        let Some((opened, snapshot)) = initial else {
            return self.finish_stopped();
        };

        match snapshot {
            Ok(snapshot) => {
                if self.absorb_snapshot(snapshot) {
                    return;
                }
            }
            Err(err) => {
                warn!(task_id = %self.task_id, session_id = %self.session_id, error = %err, "initial snapshot fetch failed");
            }
        }

        let mut attempt = opened;
        loop {
            let exit = match attempt {
                Ok(stream) => {
                    if self.failures > 0 {
                        info!(task_id = %self.task_id, session_id = %self.session_id, after = self.failures, "task stream reconnected");
                    }
                    self.failures = 0;
                    self.publisher.transition(SessionState::Live);
                    self.pump(stream).await
                }
                Err(err) => PumpExit::Disconnected(err),
            };
            let err = match exit {
                PumpExit::Disconnected(err) => err,
                PumpExit::Finished => return,
            };
            if let Recovery::Finished = self.recover(err).await {
                return;
            }
            attempt = match until_stopped(
                &mut self.stop_rx,
                self.backend.open_stream(&self.task_id),
            )
            .await
            {
                Some(result) => result,
                None => return self.finish_stopped(),
            };
        }
    }

    /// Reads envelopes until the stream ends, fails, turns terminal or the
    /// session is stopped. The stream is dropped on return.
    async fn pump(&mut self, mut stream: EnvelopeStream) -> PumpExit {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_beats = 0_u32;

        loop {
            tokio::select! {
                _ = stop_signal(&mut self.stop_rx) => {
                    self.finish_stopped();
                    return PumpExit::Finished;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(envelope)) => {
                            heartbeat.reset();
                            idle_beats = 0;
                            if self.dispatch(envelope) {
                                return PumpExit::Finished;
                            }
                        }
                        Some(Err(err)) => return PumpExit::Disconnected(err),
                        None => return PumpExit::Disconnected(TransportError::Closed),
                    }
                }
                _ = heartbeat.tick() => {
                    idle_beats = idle_beats.saturating_add(1);
                    self.projector.push_ping(Utc::now());
                    self.publish_view();
                    let poll_due = self
                        .config
                        .stall_poll_after
                        .is_some_and(|every| every > 0 && idle_beats % every == 0);
                    if poll_due && self.stall_poll().await {
                        return PumpExit::Finished;
                    }
                }
            }
        }
    }

    /// Runs one envelope through the pipeline. Returns `true` when it closed
    /// the session.
    fn dispatch(&mut self, envelope: RawEnvelope) -> bool {
        let event = match envelope.decode() {
            Ok(event) => event,
            Err(err) => {
                warn!(task_id = %self.task_id, kind = %envelope.event_kind, error = %err, "dropping undecodable envelope");
                return false;
            }
        };
        let kind = event.kind;
        let failure = failure_for(kind, &event.content);

        match self.projector.apply_event(event) {
            Applied::Inserted { index } => {
                debug!(task_id = %self.task_id, kind = %kind, index, "event projected");
            }
            Applied::Duplicate => {
                debug!(task_id = %self.task_id, kind = %kind, "duplicate event skipped");
            }
        }
        if let Some(failure) = failure {
            self.projector.record_failure(failure);
        }
        self.publish_view();

        if kind.is_terminal() {
            info!(task_id = %self.task_id, session_id = %self.session_id, kind = %kind, "task stream reached terminal event");
            self.publisher.transition(SessionState::Closed);
            return true;
        }
        false
    }

    /// Handles one transport failure: reconcile, then retry, give up or close.
    async fn recover(&mut self, err: TransportError) -> Recovery {
        self.failures += 1;
        warn!(task_id = %self.task_id, session_id = %self.session_id, attempt = self.failures, error = %err, "task stream disconnected");

        let timeout = self.config.snapshot_timeout_duration();
        let reconciled = until_stopped(
            &mut self.stop_rx,
            fetch_snapshot_bounded(self.backend.as_ref(), &self.task_id, timeout),
        )
        .await;
        match reconciled {
            None => {
                self.finish_stopped();
                return Recovery::Finished;
            }
            Some(Ok(snapshot)) => {
                if self.absorb_snapshot(snapshot) {
                    return Recovery::Finished;
                }
            }
            Some(Err(err)) => {
                warn!(task_id = %self.task_id, error = %err, "reconciliation fetch failed, continuing with retry");
            }
        }

        if self.failures >= self.config.max_retries {
            self.exhaust();
            return Recovery::Finished;
        }

        let attempt = self.failures;
        let delay = self.config.backoff.delay_for(attempt);
        self.retries += 1;
        self.projector.apply_event(NormalizedEvent::synthesized(
            EventKind::Warning,
            format!(
                "Connection interrupted, retrying in {} ({attempt}/{})",
                format_delay(delay),
                self.config.max_retries
            ),
            Some(self.retries),
            Utc::now(),
        ));
        self.publish_view();
        self.publisher.transition(SessionState::Retrying(attempt));
        debug!(task_id = %self.task_id, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        match until_stopped(&mut self.stop_rx, tokio::time::sleep(delay)).await {
            Some(()) => Recovery::Reconnect,
            None => {
                self.finish_stopped();
                Recovery::Finished
            }
        }
    }

    /// Polls a snapshot after a quiet stretch. Returns `true` when it closed
    /// the session.
    async fn stall_poll(&mut self) -> bool {
        debug!(task_id = %self.task_id, "stream idle, polling snapshot");
        let timeout = self.config.snapshot_timeout_duration();
        let polled = until_stopped(
            &mut self.stop_rx,
            fetch_snapshot_bounded(self.backend.as_ref(), &self.task_id, timeout),
        )
        .await;
        match polled {
            None => {
                self.finish_stopped();
                true
            }
            Some(Ok(snapshot)) => self.absorb_snapshot(snapshot),
            Some(Err(err)) => {
                warn!(task_id = %self.task_id, error = %err, "stall poll failed");
                false
            }
        }
    }

    /// Merges a snapshot and, if it is terminal, projects the terminal state
    /// and closes the session. Returns `true` when closed.
    fn absorb_snapshot(&mut self, snapshot: TaskSnapshot) -> bool {
        let now = Utc::now();
        let added = self.projector.apply_snapshot(&snapshot, now);
        debug!(task_id = %self.task_id, status = %snapshot.status, added, "snapshot merged");

        let terminal = match &snapshot.status {
            TaskStatus::Completed => {
                self.projector.apply_event(NormalizedEvent::synthesized(
                    EventKind::Complete,
                    TASK_COMPLETED_MESSAGE,
                    None,
                    now,
                ));
                if let Some(last) = snapshot.last_result() {
                    self.projector.set_result(EventKind::Complete, last);
                }
                true
            }
            TaskStatus::Failed(reason) => {
                let status_text = snapshot.status.to_string();
                self.projector.apply_event(NormalizedEvent::synthesized(
                    EventKind::Error,
                    format!("Error: {status_text}"),
                    None,
                    now,
                ));
                self.projector.set_result(EventKind::Error, status_text);
                self.projector.record_failure(SessionFailure::TerminalTask {
                    message: if reason.is_empty() {
                        "Task failed".to_string()
                    } else {
                        reason.clone()
                    },
                });
                true
            }
            _ => false,
        };
        self.publish_view();

        if terminal {
            info!(task_id = %self.task_id, session_id = %self.session_id, status = %snapshot.status, "snapshot reports terminal task, closing session");
            self.publisher.transition(SessionState::Closed);
        }
        terminal
    }

    fn exhaust(&mut self) {
        warn!(task_id = %self.task_id, session_id = %self.session_id, attempts = self.failures, "giving up on task stream");
        self.projector.apply_event(NormalizedEvent::synthesized(
            EventKind::Error,
            CONNECTION_LOST_MESSAGE,
            None,
            Utc::now(),
        ));
        self.projector.record_failure(SessionFailure::RetryExhausted {
            attempts: self.failures,
        });
        self.publish_view();
        self.publisher.transition(SessionState::Exhausted);
    }

    fn finish_stopped(&mut self) {
        self.publish_view();
        if self.publisher.transition(SessionState::Closed) {
            info!(task_id = %self.task_id, session_id = %self.session_id, "task stream session stopped");
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.projector.view());
    }
}

async fn fetch_snapshot_bounded(
    backend: &dyn TaskBackend,
    task_id: &TaskId,
    timeout: Duration,
) -> Result<TaskSnapshot, SnapshotFetchError> {
    match tokio::time::timeout(timeout, backend.fetch_snapshot(task_id)).await {
        Ok(result) => result,
        Err(_) => Err(SnapshotFetchError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Resolves once a stop was requested. Never resolves if the manager is gone
/// without requesting one, since its task is aborted in that case.
async fn stop_signal(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs `fut` unless a stop is requested first.
async fn until_stopped<F: Future>(
    stop_rx: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop_signal(stop_rx) => None,
        output = fut => Some(output),
    }
}

fn format_delay(delay: Duration) -> String {
    if delay < Duration::from_secs(1) {
        format!("{}ms", delay.as_millis())
    } else if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{:.1}s", delay.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NO_CONTENT;
    use crate::model::SnapshotStep;
    use crate::ordering::DisplayStep;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    enum Connection {
        Refuse,
        Script {
            envelopes: Vec<RawEnvelope>,
            hang: bool,
        },
    }

    #[derive(Default)]
    struct FakeBackend {
        connections: Mutex<VecDeque<Connection>>,
        snapshots: Mutex<VecDeque<Result<TaskSnapshot, SnapshotFetchError>>>,
        opens: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl FakeBackend {
        fn with_connections(connections: Vec<Connection>) -> Self {
            Self {
                connections: Mutex::new(connections.into()),
                ..Self::default()
            }
        }

        fn then_snapshots(self, snapshots: Vec<Result<TaskSnapshot, SnapshotFetchError>>) -> Self {
            *self.snapshots.lock().expect("lock") = snapshots.into();
            self
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TaskBackend for FakeBackend {
        async fn open_stream(&self, _task_id: &TaskId) -> Result<EnvelopeStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.connections.lock().expect("lock").pop_front();
            match next.unwrap_or(Connection::Refuse) {
                Connection::Refuse => Err(TransportError::Connect("connection refused".into())),
                Connection::Script { envelopes, hang } => {
                    let events = stream::iter(envelopes.into_iter().map(Ok::<_, TransportError>));
                    if hang {
                        Ok(Box::pin(events.chain(stream::pending())))
                    } else {
                        Ok(Box::pin(events))
                    }
                }
            }
        }

        async fn fetch_snapshot(
            &self,
            task_id: &TaskId,
        ) -> Result<TaskSnapshot, SnapshotFetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self.snapshots.lock().expect("lock").pop_front();
            next.unwrap_or_else(|| Ok(snapshot(task_id.as_str(), "running", vec![])))
        }
    }

    fn snapshot(id: &str, status: &str, steps: Vec<(&str, &str, u64)>) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(id),
            status: TaskStatus::parse(status),
            steps: steps
                .into_iter()
                .map(|(kind, result, step)| SnapshotStep {
                    kind: kind.to_string(),
                    result: Some(result.to_string()),
                    step: Some(step),
                    created_at: None,
                })
                .collect(),
            token_usage: None,
            prompt: None,
            created_at: None,
            execution_time: None,
        }
    }

    fn step(kind: &str, result: &str, step: u64) -> RawEnvelope {
        RawEnvelope::new(
            kind,
            serde_json::json!({"type": kind, "step": step, "result": result}).to_string(),
        )
    }

    fn script(envelopes: Vec<RawEnvelope>, hang: bool) -> Connection {
        Connection::Script { envelopes, hang }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .max_retries(3)
            .retry_delay(Duration::from_millis(5))
            .heartbeat(Duration::from_secs(60))
            .snapshot_timeout(Duration::from_millis(500))
            .stall_poll_after(None)
    }

    fn manager(backend: Arc<FakeBackend>, config: SessionConfig) -> SessionManager {
        SessionManager::new(backend, config).expect("manager")
    }

    async fn settle(handle: &SessionHandle) -> SessionState {
        tokio::time::timeout(WAIT, handle.settled())
            .await
            .expect("session should settle")
    }

    fn drain_changes(handle: &mut SessionHandle) -> Vec<SessionState> {
        let mut changes = Vec::new();
        while let Ok(state) = handle.changes.try_recv() {
            changes.push(state);
        }
        changes
    }

    fn count_content(view: &TaskView, content: &str) -> usize {
        view.steps.iter().filter(|s| s.content == content).count()
    }

    #[tokio::test]
    async fn exhausts_once_after_max_consecutive_failures() {
        let backend = Arc::new(FakeBackend::default());
        let mut manager = manager(backend.clone(), fast_config());
        let mut handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Exhausted);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(backend.opens(), 3, "no retry after exhaustion");
        assert_eq!(
            drain_changes(&mut handle),
            vec![
                SessionState::Connecting,
                SessionState::Retrying(1),
                SessionState::Retrying(2),
                SessionState::Exhausted,
            ]
        );
        let view = handle.view();
        assert_eq!(count_content(&view, CONNECTION_LOST_MESSAGE), 1);
        assert_eq!(
            view.result.map(|r| r.content),
            Some(CONNECTION_LOST_MESSAGE.to_string())
        );
        assert_eq!(
            view.failure,
            Some(SessionFailure::RetryExhausted { attempts: 3 })
        );
        assert_eq!(manager.state(), SessionState::Exhausted);
    }

    #[tokio::test]
    async fn completed_reconciliation_closes_without_retry() {
        let backend = Arc::new(
            FakeBackend::with_connections(vec![script(vec![step("think", "A", 1)], false)])
                .then_snapshots(vec![
                    Ok(snapshot("t-1", "running", vec![])),
                    Ok(snapshot(
                        "t-1",
                        "completed",
                        vec![("think", "A", 1), ("result", "final answer", 1)],
                    )),
                ]),
        );
        let mut manager = manager(backend.clone(), fast_config());
        let mut handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        assert_eq!(backend.opens(), 1);
        assert!(
            !drain_changes(&mut handle)
                .iter()
                .any(|s| matches!(s, SessionState::Retrying(_)))
        );

        let view = handle.view();
        assert_eq!(count_content(&view, "A"), 1, "live and snapshot step merged");
        assert_eq!(count_content(&view, "final answer"), 1);
        assert_eq!(count_content(&view, TASK_COMPLETED_MESSAGE), 1);
        let result = view.result.expect("result");
        assert_eq!(result.content, "final answer");
        assert_eq!(result.kind, EventKind::Complete);
        assert_eq!(view.status, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn complete_envelope_closes_session() {
        let backend = Arc::new(FakeBackend::with_connections(vec![script(
            vec![
                step("tool", "B", 1),
                RawEnvelope::new("complete", r#"{"type":"complete","result":"done"}"#),
            ],
            true,
        )]));
        let mut manager = manager(backend.clone(), fast_config());
        let handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        let view = handle.view();
        assert_eq!(view.result.map(|r| r.content), Some("done".to_string()));
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn error_envelope_records_terminal_failure() {
        let backend = Arc::new(FakeBackend::with_connections(vec![script(
            vec![RawEnvelope::new(
                "error",
                r#"{"type":"error","message":"browser crashed"}"#,
            )],
            true,
        )]));
        let mut manager = manager(backend, fast_config());
        let handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        let view = handle.view();
        assert_eq!(
            view.failure,
            Some(SessionFailure::TerminalTask {
                message: "browser crashed".into()
            })
        );
        assert_eq!(view.result.map(|r| r.kind), Some(EventKind::Error));
    }

    #[tokio::test]
    async fn replayed_events_after_reconnect_are_deduplicated() {
        let backend = Arc::new(FakeBackend::with_connections(vec![
            script(vec![step("think", "A", 1), step("tool", "B", 1)], false),
            script(
                vec![
                    step("think", "A", 1),
                    step("tool", "B", 1),
                    step("run", "C", 2),
                    RawEnvelope::new("complete", r#"{"type":"complete"}"#),
                ],
                true,
            ),
        ]));
        let mut manager = manager(backend.clone(), fast_config());
        let mut handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        assert_eq!(backend.opens(), 2);
        assert_eq!(
            drain_changes(&mut handle),
            vec![
                SessionState::Connecting,
                SessionState::Live,
                SessionState::Retrying(1),
                SessionState::Live,
                SessionState::Closed,
            ]
        );
        let view = handle.view();
        let contents: Vec<&str> = view
            .steps
            .iter()
            .filter(|s| s.kind != EventKind::Warning)
            .map(|s| s.content.as_str())
            .collect();
        assert_eq!(contents, vec!["A", "B", "C", NO_CONTENT]);
        assert_eq!(
            view.steps
                .iter()
                .filter(|s| s.kind == EventKind::Warning)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn reconnect_resets_failure_count() {
        let backend = Arc::new(FakeBackend::with_connections(vec![
            script(vec![], false),
            script(vec![step("log", "back", 0)], false),
            Connection::Refuse,
        ]));
        let mut manager = manager(backend.clone(), fast_config().max_retries(2));
        let mut handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Exhausted);
        assert_eq!(backend.opens(), 3);
        let changes = drain_changes(&mut handle);
        assert_eq!(
            changes,
            vec![
                SessionState::Connecting,
                SessionState::Live,
                SessionState::Retrying(1),
                SessionState::Live,
                SessionState::Retrying(1),
                SessionState::Exhausted,
            ]
        );

        let notices: Vec<DisplayStep> = handle
            .view()
            .steps
            .into_iter()
            .filter(|s| s.kind == EventKind::Warning)
            .collect();
        assert_eq!(notices.len(), 2, "every interruption gets its own notice");
        assert!(
            notices
                .iter()
                .all(|s| s.content == "Connection interrupted, retrying in 5ms (1/2)")
        );
    }

    #[tokio::test]
    async fn malformed_envelopes_are_dropped() {
        let backend = Arc::new(FakeBackend::with_connections(vec![script(
            vec![
                RawEnvelope::new("think", "not json"),
                RawEnvelope::new("mystery", "{}"),
                step("act", "clicked", 1),
                RawEnvelope::new("complete", "{}"),
            ],
            true,
        )]));
        let mut manager = manager(backend, fast_config());
        let handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        let view = handle.view();
        assert_eq!(view.steps.len(), 2);
        assert_eq!(view.steps[0].content, "clicked");
    }

    #[tokio::test]
    async fn terminal_snapshot_at_start_closes_immediately() {
        let backend = Arc::new(
            FakeBackend::with_connections(vec![script(vec![], true)]).then_snapshots(vec![Ok(
                snapshot("t-1", "failed: out of credits", vec![("think", "A", 0)]),
            )]),
        );
        let mut manager = manager(backend, fast_config());
        let handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        let view = handle.view();
        assert_eq!(count_content(&view, "A"), 1);
        assert_eq!(
            view.result.map(|r| r.content),
            Some("failed: out of credits".to_string())
        );
        assert_eq!(
            view.failure,
            Some(SessionFailure::TerminalTask {
                message: "out of credits".into()
            })
        );
    }

    #[tokio::test]
    async fn heartbeat_synthesizes_ping_when_idle() {
        let backend = Arc::new(FakeBackend::with_connections(vec![script(vec![], true)]));
        let mut manager = manager(
            backend,
            fast_config().heartbeat(Duration::from_millis(20)),
        );
        let handle = manager.start_session("t-1");

        let mut view = handle.subscribe_view();
        tokio::time::timeout(WAIT, view.wait_for(|v| v.steps.iter().any(|s| s.is_ping())))
            .await
            .expect("ping within timeout")
            .expect("view sender alive");
        assert_eq!(handle.state(), SessionState::Live);
        manager.stop();
    }

    #[tokio::test]
    async fn stall_poll_closes_on_failed_snapshot() {
        let backend = Arc::new(
            FakeBackend::with_connections(vec![script(vec![], true)]).then_snapshots(vec![
                Ok(snapshot("t-1", "running", vec![])),
                Ok(snapshot("t-1", "running", vec![])),
                Ok(snapshot("t-1", "failed: boom", vec![])),
            ]),
        );
        let mut manager = manager(
            backend.clone(),
            fast_config()
                .heartbeat(Duration::from_millis(10))
                .stall_poll_after(Some(2)),
        );
        let handle = manager.start_session("t-1");

        assert_eq!(settle(&handle).await, SessionState::Closed);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(
            handle.view().failure,
            Some(SessionFailure::TerminalTask {
                message: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn reconciliation_timeout_falls_through_to_retry() {
        struct SlowSnapshots;

        #[async_trait::async_trait]
        impl TaskBackend for SlowSnapshots {
            async fn open_stream(
                &self,
                _task_id: &TaskId,
            ) -> Result<EnvelopeStream, TransportError> {
                Err(TransportError::Connect("refused".into()))
            }

            async fn fetch_snapshot(
                &self,
                _task_id: &TaskId,
            ) -> Result<TaskSnapshot, SnapshotFetchError> {
                std::future::pending().await
            }
        }

        let mut manager = SessionManager::new(
            Arc::new(SlowSnapshots),
            fast_config()
                .max_retries(2)
                .snapshot_timeout(Duration::from_millis(10)),
        )
        .expect("manager");
        let handle = manager.start_session("t-1");
        assert_eq!(settle(&handle).await, SessionState::Exhausted);
    }

    #[tokio::test]
    async fn stop_closes_session_and_cancels_timers() {
        let backend = Arc::new(FakeBackend::with_connections(vec![script(vec![], true)]));
        let mut manager = manager(
            backend.clone(),
            fast_config().heartbeat(Duration::from_millis(10)),
        );
        let handle = manager.start_session("t-1");

        let mut state = handle.subscribe_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Live))
            .await
            .expect("live within timeout")
            .expect("state sender alive");

        manager.stop();
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(manager.state(), SessionState::Idle);

        let revision = handle.view().revision;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.view().revision, revision, "no updates after stop");
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn stop_while_retrying_cancels_the_pending_reconnect() {
        let backend = Arc::new(FakeBackend::default());
        let mut manager = manager(
            backend.clone(),
            fast_config().retry_delay(Duration::from_millis(200)),
        );
        let handle = manager.start_session("t-1");

        let mut state = handle.subscribe_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Retrying(1)))
            .await
            .expect("retrying within timeout")
            .expect("state sender alive");

        manager.stop();
        assert_eq!(handle.state(), SessionState::Closed);

        let revision = handle.view().revision;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.opens(), 1, "no reconnect after stop");
        assert_eq!(handle.view().revision, revision);
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn change_feed_ends_once_the_manager_releases_a_settled_session() {
        let backend = Arc::new(FakeBackend::default());
        let mut manager = manager(backend, fast_config());
        let mut handle = manager.start_session("t-1");
        assert_eq!(settle(&handle).await, SessionState::Exhausted);

        drop(manager);
        let mut delivered = Vec::new();
        while let Some(state) = tokio::time::timeout(WAIT, handle.next_state_change())
            .await
            .expect("feed should end")
        {
            delivered.push(state);
        }
        assert_eq!(delivered.last(), Some(&SessionState::Closed));
        assert!(delivered.contains(&SessionState::Exhausted));
    }

    #[tokio::test]
    async fn starting_a_new_session_closes_the_previous_one() {
        let backend = Arc::new(FakeBackend::with_connections(vec![
            script(vec![], true),
            script(vec![], true),
        ]));
        let mut manager = manager(backend.clone(), fast_config());
        let first = manager.start_session("t-1");
        let mut first_state = first.subscribe_state();
        tokio::time::timeout(WAIT, first_state.wait_for(|s| *s == SessionState::Live))
            .await
            .expect("first session live")
            .expect("state sender alive");

        let second = manager.start_session("t-2");
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(manager.active_task(), Some(&TaskId::new("t-2")));
        assert_ne!(first.session_id(), second.session_id());

        let mut second_state = second.subscribe_state();
        tokio::time::timeout(WAIT, second_state.wait_for(|s| *s == SessionState::Live))
            .await
            .expect("second session live")
            .expect("state sender alive");
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(backend.opens(), 2);
        manager.stop();
    }

    #[test]
    fn settled_states_absorb_transitions() {
        assert!(!SessionState::Closed.accepts(SessionState::Live));
        assert!(SessionState::Exhausted.accepts(SessionState::Closed));
        assert!(!SessionState::Exhausted.accepts(SessionState::Retrying(1)));
        assert!(SessionState::Retrying(1).accepts(SessionState::Retrying(2)));
    }

    #[test]
    fn delays_format_compactly() {
        assert_eq!(format_delay(Duration::from_secs(2)), "2s");
        assert_eq!(format_delay(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_delay(Duration::from_millis(250)), "250ms");
    }
}
