use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::Fingerprint;
use crate::envelope::NormalizedEvent;
use crate::model::EventKind;

/// Content of synthesized heartbeat steps.
pub const PING_CONTENT: &str = "·";

/// One entry of the projected step list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayStep {
    pub kind: EventKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub step_number: Option<u64>,
}

impl DisplayStep {
    pub fn is_ping(&self) -> bool {
        self.kind == EventKind::Ping
    }
}

impl From<&NormalizedEvent> for DisplayStep {
    fn from(event: &NormalizedEvent) -> Self {
        Self {
            kind: event.kind,
            content: event.content.clone(),
            timestamp: event.occurred_at,
            step_number: event.step,
        }
    }
}

/// Where an event landed in the display order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    Inserted(usize),
    AlreadyPlaced,
}

#[derive(Debug)]
struct Slot {
    fingerprint: Option<Fingerprint>,
    step: DisplayStep,
}

/// Keeps display steps sorted by `occurred_at`, ties in arrival order.
#[derive(Debug, Default)]
pub struct OrderingBuffer {
    slots: Vec<Slot>,
}

impl OrderingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places an event after every step that occurred at or before it.
    ///
    /// Re-placing a fingerprint that is already present is a no-op.
    pub fn place(&mut self, fingerprint: Fingerprint, step: DisplayStep) -> Placement {
        if self
            .slots
            .iter()
            .any(|slot| slot.fingerprint.as_ref() == Some(&fingerprint))
        {
            return Placement::AlreadyPlaced;
        }
        let index = self
            .slots
            .iter()
            .rposition(|slot| slot.step.timestamp <= step.timestamp)
            .map_or(0, |i| i + 1);
        self.slots.insert(
            index,
            Slot {
                fingerprint: Some(fingerprint),
                step,
            },
        );
        Placement::Inserted(index)
    }

    /// Appends at the tail regardless of timestamp. Used for heartbeats.
    pub fn append_unordered(&mut self, step: DisplayStep) -> usize {
        self.slots.push(Slot {
            fingerprint: None,
            step,
        });
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &DisplayStep> {
        self.slots.iter().map(|slot| &slot.step)
    }
}
