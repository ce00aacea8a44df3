use std::collections::HashSet;

use crate::envelope::NormalizedEvent;
use crate::model::EventKind;

/// Canonical identity of a logical event.
///
/// Built from kind, content and step (0 when absent). Terminal kinds are not
/// step-indexed, so their fingerprint leaves the step out entirely.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint {
    kind: EventKind,
    content: String,
    step: Option<u64>,
}

impl Fingerprint {
    pub fn new(kind: EventKind, content: impl Into<String>, step: Option<u64>) -> Self {
        let step = if kind.is_terminal() {
            None
        } else {
            Some(step.unwrap_or(0))
        };
        Self {
            kind,
            content: content.into(),
            step,
        }
    }
}

impl NormalizedEvent {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.kind, self.content.clone(), self.step)
    }
}

/// Set of fingerprints already applied for one task view.
///
/// Lives as long as the session's task, surviving reconnects.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: HashSet<Fingerprint>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn record(&mut self, fingerprint: Fingerprint) {
        self.seen.insert(fingerprint);
    }

    /// Records the fingerprint and returns `true` if it was not seen before.
    pub fn check_and_record(&mut self, fingerprint: Fingerprint) -> bool {
        self.seen.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_step_defaults_to_zero() {
        assert_eq!(
            Fingerprint::new(EventKind::Think, "A", None),
            Fingerprint::new(EventKind::Think, "A", Some(0))
        );
        assert_ne!(
            Fingerprint::new(EventKind::Think, "A", Some(1)),
            Fingerprint::new(EventKind::Think, "A", Some(0))
        );
    }

    #[test]
    fn terminal_fingerprints_ignore_step() {
        assert_eq!(
            Fingerprint::new(EventKind::Error, "boom", Some(4)),
            Fingerprint::new(EventKind::Error, "boom", None)
        );
        assert_ne!(
            Fingerprint::new(EventKind::Error, "boom", None),
            Fingerprint::new(EventKind::Complete, "boom", None)
        );
    }

    #[test]
    fn ledger_reports_first_sighting_only() {
        let mut ledger = DedupLedger::new();
        let fp = Fingerprint::new(EventKind::Tool, "B", Some(1));
        assert!(!ledger.seen(&fp));
        assert!(ledger.check_and_record(fp.clone()));
        assert!(ledger.seen(&fp));
        assert!(!ledger.check_and_record(fp.clone()));
        ledger.record(fp);
        assert_eq!(ledger.len(), 1);
    }
}
