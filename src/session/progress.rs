//! Progress snapshots and push subscriptions.
//!
//! Every task transition publishes one snapshot on the session's broadcast
//! channel. The transition that makes the session terminal publishes the
//! terminal snapshot, after which subscriber streams end.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::SessionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    /// Increments with every published snapshot
    pub sequence: u64,
    pub status: SessionStatus,
    /// completed_tasks / total_tasks
    pub progress: f64,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    /// Names of tasks still running
    pub current_tasks: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressSnapshot> + Send>>;

/// Per-session fan-out of snapshots.
pub(crate) struct ProgressHub {
    tx: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Hub for a session of `task_count` tasks. The configured capacity is
    /// raised to the most snapshots one session can publish (one on start,
    /// two per task) so a subscriber that reads late still sees every one.
    pub fn for_session(configured: usize, task_count: usize) -> Self {
        Self::new(configured.max(session_capacity(task_count)))
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        // No subscribers is fine; polling still works.
        let _ = self.tx.send(snapshot);
    }

    /// Stream starting at `current` and following live updates until the
    /// terminal snapshot.
    ///
    /// Must be called while holding the session state lock that produced
    /// `current`, so that no snapshot falls between the two.
    pub fn subscribe_from(&self, current: ProgressSnapshot) -> ProgressStream {
        let mut rx = self.tx.subscribe();
        let stream = async_stream::stream! {
            let mut last_seq = current.sequence;
            let done = current.is_terminal();
            yield current;
            if done {
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(snapshot) => {
                        if snapshot.sequence <= last_seq {
                            continue;
                        }
                        last_seq = snapshot.sequence;
                        let done = snapshot.is_terminal();
                        yield snapshot;
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Progress subscriber lagged, skipping snapshots");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}

fn session_capacity(task_count: usize) -> usize {
    2 * task_count + 2
}
