//! Mutation events - what the shim reports when the document changes
//!
//! Design: bounded tokio mpsc, non-blocking on the producer side.
//! The worker must never wait on the host, so a full channel drops the
//! newest entry and logs instead of applying backpressure.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Attribute,
    Child,
    Text,
    Other,
}

impl MutationKind {
    /// Map the shim's numeric mutation codes
    ///
    /// 1 = value, 2 = attribute set, 3 = attribute removed,
    /// 4 = child removed, 5 = moved, 6 = inserted.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MutationKind::Text,
            2 | 3 => MutationKind::Attribute,
            4..=6 => MutationKind::Child,
            _ => MutationKind::Other,
        }
    }
}

/// One recorded change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub timestamp: SystemTime,
    pub kind: MutationKind,
    /// Path selector of the mutated node
    pub selector: String,
}

/// Producer half, owned by the shim natives on the worker
#[derive(Clone)]
pub struct MutationRecorder {
    tx: mpsc::Sender<Mutation>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half, owned by the change tracker
pub struct MutationQueue {
    rx: mpsc::Receiver<Mutation>,
    dropped: Arc<AtomicU64>,
}

/// Create a bounded recorder/queue pair
pub fn mutation_channel(capacity: usize) -> (MutationRecorder, MutationQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        MutationRecorder {
            tx,
            dropped: Arc::clone(&dropped),
        },
        MutationQueue { rx, dropped },
    )
}

impl MutationRecorder {
    /// Record a mutation without blocking; returns false if it was dropped
    pub fn record(&self, kind: MutationKind, selector: impl Into<String>) -> bool {
        let mutation = Mutation {
            timestamp: SystemTime::now(),
            kind,
            selector: selector.into(),
        };

        match self.tx.try_send(mutation) {
            Ok(()) => true,
            Err(TrySendError::Full(mutation)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    selector = %mutation.selector,
                    "Mutation backlog full, dropping change"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Mutation queue closed");
                false
            }
        }
    }
}

impl MutationQueue {
    pub async fn recv(&mut self) -> Option<Mutation> {
        self.rx.recv().await
    }

    /// Mutations lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
