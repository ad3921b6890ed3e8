//! Change Tracker - waits for the document to go quiet
//!
//! `drain` consumes mutations until none arrives for one quiescence window.
//! The drain itself never re-serializes; the session does that only when
//! at least one mutation was observed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{Mutation, MutationQueue};

/// Result of `TrackChanges`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    pub html: String,
    pub changed: bool,
}

/// What one drain observed
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub observed: usize,
    /// Distinct selectors in arrival order
    pub selectors: Vec<String>,
    /// Stopped on the drain cap rather than on quiescence
    pub capped: bool,
}

pub struct ChangeTracker {
    queue: MutationQueue,
    quiescence: Duration,
    max_drain: Duration,
}

impl ChangeTracker {
    pub fn new(queue: MutationQueue, quiescence: Duration, max_drain: Duration) -> Self {
        Self {
            queue,
            quiescence,
            max_drain,
        }
    }

    /// Consume mutations until one quiescence window passes without any.
    ///
    /// A page that never stops mutating is cut off after `max_drain`.
    pub async fn drain(&mut self) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            let remaining = self.max_drain.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::warn!(
                    observed = report.observed,
                    "Document still mutating after {:?}, serializing anyway",
                    self.max_drain
                );
                report.capped = true;
                break;
            }

            match tokio::time::timeout(self.quiescence.min(remaining), self.queue.recv()).await {
                Ok(Some(mutation)) => record(&mut report, mutation),
                Ok(None) => break,
                Err(_) if self.quiescence <= remaining => break,
                Err(_) => continue,
            }
        }

        let dropped = self.queue.dropped();
        if dropped > 0 {
            tracing::debug!(dropped, "Mutations dropped on overflow so far");
        }
        report
    }
}

fn record(report: &mut DrainReport, mutation: Mutation) {
    tracing::trace!(kind = ?mutation.kind, selector = %mutation.selector, "Mutation");
    report.observed += 1;
    if !report.selectors.contains(&mutation.selector) {
        report.selectors.push(mutation.selector);
    }
}
