use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use lavastorm_sched::JobSpec;

/// A future submission parked until its release time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    /// Earliest instant at which the submission may be handed to the
    /// backend.
    pub release_at: DateTime<Utc>,
    /// What to submit.
    pub spec: JobSpec,
}

/// Time-ordered buffer of pending submissions.
///
/// Ordered by `release_at` ascending; entries sharing a release time keep
/// their insertion order.
#[derive(Debug, Default)]
pub(crate) struct SubmitQueue {
    entries: VecDeque<PendingSubmission>,
}

impl SubmitQueue {
    pub(crate) fn push(&mut self, submission: PendingSubmission) {
        let pos = self
            .entries
            .partition_point(|entry| entry.release_at <= submission.release_at);
        self.entries.insert(pos, submission);
    }

    /// Remove and return every entry due at `now`, oldest first. Each
    /// entry comes out exactly once.
    pub(crate) fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<PendingSubmission> {
        let mut due = Vec::new();
        while self.entries.front().is_some_and(|entry| entry.release_at <= now) {
            due.push(self.entries.pop_front().expect("front checked"));
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
