//! Session and task state.
//!
//! A [`Session`] is one run of a selected subset of the catalog. Its status
//! is never assigned directly: it is derived from the task states plus the
//! start/failure markers (see [`Session::derive_status`]), so it cannot drift
//! from what the tasks report.
//!
//! ```text
//!   Pending ──start──▶ Running ──all tasks terminal──▶ Completed
//!      │                  │                         └─▶ Cancelled (any task cancelled)
//!      └──cancel──────────┴──cancel─────────────────────▶ Cancelled
//!   Pending ──start fails before dispatch─────────────▶ Failed
//! ```

mod progress;
mod scheduler;

pub use progress::{ProgressSnapshot, ProgressStream};
pub use scheduler::{SessionScheduler, SessionSummary};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{TaskCategory, TaskDescriptor};
use crate::package::OutputFormat;
use crate::system_info::SystemInfo;

/// Session-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    /// Scheduler-level failure only; task failures never produce this.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single task within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One named piece of captured output (a text dump, an exported log, a dump file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub data: Bytes,
}

/// Everything a succeeded task captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub artifacts: Vec<Artifact>,
}

impl TaskOutput {
    pub fn total_bytes(&self) -> usize {
        self.artifacts.iter().map(|a| a.data.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: String,
    pub name: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    /// Present only when `Succeeded`
    pub output: Option<TaskOutput>,
    /// Present only when `Failed`
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl TaskState {
    fn pending(descriptor: &TaskDescriptor) -> Self {
        Self {
            task_id: descriptor.id.clone(),
            name: descriptor.display_name.clone(),
            category: descriptor.category,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub selected_task_ids: Vec<String>,
    /// One entry per selected id, in selection order
    pub task_states: Vec<TaskState>,
    pub output_format: OutputFormat,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only once the session has `Completed` and its bundle was written
    pub output_location: Option<PathBuf>,
    /// Scheduler-level failure message
    pub failure: Option<String>,
    pub cancel_requested: bool,
    pub system_info: Option<SystemInfo>,
    /// Number of progress snapshots published so far
    pub(crate) sequence: u64,
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        descriptors: &[Arc<TaskDescriptor>],
        output_format: OutputFormat,
    ) -> Self {
        Self {
            id,
            status: SessionStatus::Pending,
            selected_task_ids: descriptors.iter().map(|d| d.id.clone()).collect(),
            task_states: descriptors.iter().map(|d| TaskState::pending(d)).collect(),
            output_format,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_location: None,
            failure: None,
            cancel_requested: false,
            system_info: None,
            sequence: 0,
        }
    }

    pub fn task_state(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.iter().find(|t| t.task_id == task_id)
    }

    /// Tasks in a terminal state.
    pub fn completed_count(&self) -> usize {
        self.task_states
            .iter()
            .filter(|t| t.status.is_terminal())
            .count()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.task_states.iter().filter(|t| t.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.task_states.iter().all(|t| t.status.is_terminal())
    }

    /// Fraction of tasks in a terminal state. Only ever grows.
    pub fn progress(&self) -> f64 {
        if self.task_states.is_empty() {
            return 1.0;
        }
        self.completed_count() as f64 / self.task_states.len() as f64
    }

    /// Display names of tasks currently executing.
    pub fn current_tasks(&self) -> Vec<String> {
        self.task_states
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.name.clone())
            .collect()
    }

    /// Human-readable list of everything that went wrong.
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self.failure.iter().cloned().collect();
        errors.extend(self.task_states.iter().filter_map(|t| {
            t.error
                .as_ref()
                .map(|e| format!("{}: {}", t.name, e))
        }));
        errors
    }

    /// Session status as a function of the task states.
    ///
    /// A scheduler failure wins; otherwise the session is terminal once every
    /// task is, and it is `Cancelled` if any task ended cancelled.
    pub fn derive_status(&self) -> SessionStatus {
        if self.failure.is_some() {
            return SessionStatus::Failed;
        }
        if self.all_terminal() {
            if self
                .task_states
                .iter()
                .any(|t| t.status == TaskStatus::Cancelled)
            {
                return SessionStatus::Cancelled;
            }
            return SessionStatus::Completed;
        }
        if self.started_at.is_some() {
            SessionStatus::Running
        } else {
            SessionStatus::Pending
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            session_id: self.id,
            sequence: self.sequence,
            status: self.status,
            progress: self.progress(),
            completed_tasks: self.completed_count(),
            total_tasks: self.task_states.len(),
            current_tasks: self.current_tasks(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, Succeed};

    fn session_with(n: usize) -> Session {
        let descriptors: Vec<_> = (0..n)
            .map(|i| Arc::new(descriptor(&format!("task {}", i), Succeed::text("ok"))))
            .collect();
        Session::new(Uuid::new_v4(), &descriptors, OutputFormat::Json)
    }

    #[test]
    fn test_new_session_mirrors_selection() {
        let session = session_with(3);
        let keys: Vec<_> = session.task_states.iter().map(|t| t.task_id.clone()).collect();
        assert_eq!(keys, session.selected_task_ids);
        assert_eq!(session.derive_status(), SessionStatus::Pending);
        assert_eq!(session.progress(), 0.0);
    }

    #[test]
    fn test_failures_do_not_fail_the_session() {
        let mut session = session_with(3);
        session.started_at = Some(Utc::now());
        assert_eq!(session.derive_status(), SessionStatus::Running);

        session.task_states[0].status = TaskStatus::Succeeded;
        session.task_states[1].status = TaskStatus::Failed;
        session.task_states[1].error = Some("missing".to_string());
        assert_eq!(session.derive_status(), SessionStatus::Running);

        session.task_states[2].status = TaskStatus::Succeeded;
        assert_eq!(session.derive_status(), SessionStatus::Completed);
        assert_eq!(session.errors(), vec!["task 1: missing".to_string()]);
    }

    #[test]
    fn test_any_cancelled_task_cancels_session() {
        let mut session = session_with(2);
        session.started_at = Some(Utc::now());
        session.task_states[0].status = TaskStatus::Succeeded;
        session.task_states[1].status = TaskStatus::Cancelled;
        assert_eq!(session.derive_status(), SessionStatus::Cancelled);
        assert_eq!(session.progress(), 1.0);
    }

    #[test]
    fn test_scheduler_failure_wins() {
        let mut session = session_with(1);
        session.failure = Some("no scratch dir".to_string());
        assert_eq!(session.derive_status(), SessionStatus::Failed);
    }
}
