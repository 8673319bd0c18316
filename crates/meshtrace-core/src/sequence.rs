//! Bookkeeping for one-shot command sequences.

use crate::error::{CoreError, Result};

/// Monotonic id of a one-shot command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(pub u64);

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Enforces the single-outstanding-sequence submission model.
///
/// Sequences complete in the order they were begun, so "has `s` completed"
/// reduces to a watermark comparison.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next: u64,
    outstanding: Option<SequenceId>,
    completed: Option<SequenceId>,
    abandoned: Vec<SequenceId>,
}

impl SequenceTracker {
    /// Creates a tracker with no sequences issued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next sequence id. Fails if one is still outstanding.
    pub fn begin(&mut self) -> Result<SequenceId> {
        if let Some(outstanding) = self.outstanding {
            return Err(CoreError::SequenceOutstanding {
                outstanding: outstanding.0,
            });
        }
        let id = SequenceId(self.next);
        self.next += 1;
        self.outstanding = Some(id);
        Ok(id)
    }

    /// Marks the outstanding sequence as fully executed by the device.
    pub fn complete(&mut self, id: SequenceId) -> Result<()> {
        if self.outstanding != Some(id) {
            return Err(CoreError::UnknownSequence(id.0));
        }
        self.outstanding = None;
        self.completed = Some(id);
        Ok(())
    }

    /// Drops the outstanding sequence without executing it.
    pub fn abandon(&mut self, id: SequenceId) -> Result<()> {
        if self.outstanding != Some(id) {
            return Err(CoreError::UnknownSequence(id.0));
        }
        self.outstanding = None;
        self.abandoned.push(id);
        Ok(())
    }

    /// The sequence currently being recorded, if any.
    pub fn outstanding(&self) -> Option<SequenceId> {
        self.outstanding
    }

    /// Whether `id` has been submitted and waited on.
    pub fn is_complete(&self, id: SequenceId) -> bool {
        self.completed.is_some_and(|c| c >= id) && !self.abandoned.contains(&id)
    }

    /// Whether `id` was dropped without executing.
    pub fn is_abandoned(&self, id: SequenceId) -> bool {
        self.abandoned.contains(&id)
    }

    /// Whether `id` has left the queue, by completion or abandonment.
    pub fn is_settled(&self, id: SequenceId) -> bool {
        self.is_complete(id) || self.is_abandoned(id)
    }

    /// The highest completed sequence.
    pub fn last_completed(&self) -> Option<SequenceId> {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_outstanding() {
        let mut tracker = SequenceTracker::new();
        let first = tracker.begin().unwrap();
        assert!(matches!(
            tracker.begin().unwrap_err(),
            CoreError::SequenceOutstanding { outstanding: 0 }
        ));
        tracker.complete(first).unwrap();
        let second = tracker.begin().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_completion_watermark() {
        let mut tracker = SequenceTracker::new();
        let a = tracker.begin().unwrap();
        assert!(!tracker.is_complete(a));
        tracker.complete(a).unwrap();
        assert!(tracker.is_complete(a));

        let b = tracker.begin().unwrap();
        assert!(!tracker.is_complete(b));
        assert!(tracker.is_complete(a));
        tracker.complete(b).unwrap();
        assert_eq!(tracker.last_completed(), Some(b));
    }

    #[test]
    fn test_abandoned_sequence_never_completes() {
        let mut tracker = SequenceTracker::new();
        let a = tracker.begin().unwrap();
        tracker.abandon(a).unwrap();
        assert!(!tracker.is_complete(a));
        assert!(tracker.is_settled(a));
        assert!(tracker.outstanding().is_none());
        let b = tracker.begin().unwrap();
        tracker.complete(b).unwrap();
        assert!(tracker.is_complete(b));
        assert!(!tracker.is_complete(a));
    }

    #[test]
    fn test_complete_wrong_id() {
        let mut tracker = SequenceTracker::new();
        let a = tracker.begin().unwrap();
        assert!(tracker.complete(SequenceId(a.0 + 1)).is_err());
        tracker.complete(a).unwrap();
        assert!(tracker.complete(a).is_err());
    }
}
