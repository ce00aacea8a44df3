use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dedup::DedupLedger;
use crate::envelope::{NormalizedEvent, StatusReport};
use crate::errors::{SessionFailure, failure_for};
use crate::model::{EventKind, SnapshotStep, TaskId, TaskSnapshot, TaskStatus, TokenUsage};
use crate::ordering::{DisplayStep, OrderingBuffer, PING_CONTENT, Placement};

/// The single "current result" slot shown next to the step list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSlot {
    pub kind: EventKind,
    pub content: String,
    pub visible: bool,
}

/// Externally observable state of one task view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub steps: Vec<DisplayStep>,
    pub status: Option<TaskStatus>,
    pub result: Option<ResultSlot>,
    pub token_usage: Option<TokenUsage>,
    pub execution_time: Option<f64>,
    pub failure: Option<SessionFailure>,
    /// Increases on every projected change.
    pub revision: u64,
}

impl TaskView {
    pub fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            steps: Vec::new(),
            status: None,
            result: None,
            token_usage: None,
            execution_time: None,
            failure: None,
            revision: 0,
        }
    }
}

/// Outcome of applying one event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Applied {
    Inserted { index: usize },
    Duplicate,
}

/// Folds deduplicated, ordered events and snapshots into a `TaskView`.
///
/// The projector is the only writer of UI-facing state. Live and snapshot
/// steps share one fingerprint space through the ledger it is given.
#[derive(Debug)]
pub struct TaskProjector {
    task_id: TaskId,
    ledger: DedupLedger,
    buffer: OrderingBuffer,
    status: Option<TaskStatus>,
    result: Option<ResultSlot>,
    token_usage: Option<TokenUsage>,
    execution_time: Option<f64>,
    failure: Option<SessionFailure>,
    revision: u64,
}

impl TaskProjector {
    pub fn new(task_id: TaskId, ledger: DedupLedger) -> Self {
        Self {
            task_id,
            ledger,
            buffer: OrderingBuffer::new(),
            status: None,
            result: None,
            token_usage: None,
            execution_time: None,
            failure: None,
            revision: 0,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Applies one event through dedup and ordering.
    ///
    /// The structured part of a status event is applied even when its status
    /// line is a duplicate, since the embedded step list may have grown.
    pub fn apply_event(&mut self, mut event: NormalizedEvent) -> Applied {
        if let Some(report) = event.status.take() {
            self.apply_status_report(report, event.received_at);
        }

        let fingerprint = event.fingerprint();
        if !self.ledger.check_and_record(fingerprint.clone()) {
            return Applied::Duplicate;
        }

        if event.kind.is_panel_worthy() {
            self.result = Some(ResultSlot {
                kind: event.kind,
                content: event.content.clone(),
                visible: true,
            });
        }

        self.revision += 1;
        match self.buffer.place(fingerprint, DisplayStep::from(&event)) {
            Placement::Inserted(index) => Applied::Inserted { index },
            Placement::AlreadyPlaced => Applied::Duplicate,
        }
    }

    /// Merges a fetched snapshot. Returns how many new steps were added.
    pub fn apply_snapshot(&mut self, snapshot: &TaskSnapshot, received_at: DateTime<Utc>) -> usize {
        self.status = Some(snapshot.status.clone());
        if let Some(usage) = snapshot.token_usage {
            self.token_usage = Some(usage);
        }
        if let Some(seconds) = snapshot.execution_time {
            self.execution_time = Some(seconds);
        }
        self.revision += 1;
        self.merge_steps(&snapshot.steps, received_at)
    }

    /// Appends a heartbeat step outside dedup and ordering.
    pub fn push_ping(&mut self, at: DateTime<Utc>) {
        self.buffer.append_unordered(DisplayStep {
            kind: EventKind::Ping,
            content: PING_CONTENT.to_string(),
            timestamp: at,
            step_number: None,
        });
        self.revision += 1;
    }

    /// Overrides the result slot, for terminal states projected from a snapshot.
    pub fn set_result(&mut self, kind: EventKind, content: impl Into<String>) {
        self.result = Some(ResultSlot {
            kind,
            content: content.into(),
            visible: true,
        });
        self.revision += 1;
    }

    pub fn record_failure(&mut self, failure: SessionFailure) {
        self.failure = Some(failure);
        self.revision += 1;
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            steps: self.buffer.steps().cloned().collect(),
            status: self.status.clone(),
            result: self.result.clone(),
            token_usage: self.token_usage,
            execution_time: self.execution_time,
            failure: self.failure.clone(),
            revision: self.revision,
        }
    }

    fn apply_status_report(&mut self, report: StatusReport, received_at: DateTime<Utc>) {
        if let Some(status) = report.status {
            if let TaskStatus::Failed(reason) = &status
                && self.failure.is_none()
            {
                self.failure = failure_for(EventKind::Error, reason);
            }
            self.status = Some(status);
        }
        if let Some(usage) = report.token_usage {
            self.token_usage = Some(usage);
        }
        if let Some(seconds) = report.execution_time {
            self.execution_time = Some(seconds);
        }
        self.revision += 1;
        self.merge_steps(&report.steps, received_at);
    }

    fn merge_steps(&mut self, steps: &[SnapshotStep], received_at: DateTime<Utc>) -> usize {
        let mut added = 0;
        for step in steps {
            let Some(event) = NormalizedEvent::from_snapshot_step(step, received_at) else {
                continue;
            };
            let fingerprint = event.fingerprint();
            if !self.ledger.check_and_record(fingerprint.clone()) {
                continue;
            }
            if let Placement::Inserted(_) = self.buffer.place(fingerprint, DisplayStep::from(&event))
            {
                added += 1;
            }
        }
        if added > 0 {
            debug!(task_id = %self.task_id, added, "merged snapshot steps");
            self.revision += 1;
        }
        added
    }
}
