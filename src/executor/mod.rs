//! Task execution.
//!
//! A task's content is a [`TaskAction`]: given an [`OutputSink`] it captures
//! text or binary artifacts, or fails. [`TaskExecutor`] wraps one action run
//! with timing, failure capture and cancellation:
//!
//! - cancelled before start: the action is never invoked
//! - cancelled while running: the action future is dropped, which kills any
//!   process it spawned (see [`command`])
//! - a failing action only ever affects its own outcome

pub mod collect;
pub mod command;

pub use collect::{DirectoryAction, FileAction, ProcessListAction, SystemSummaryAction};
pub use command::{CommandAction, CommandStep};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cancel::ProcessRegistry;
use crate::catalog::TaskDescriptor;
use crate::error::TaskFailure;
use crate::session::{Artifact, TaskOutput, TaskStatus};

/// The "execute" capability of a task descriptor.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn execute(&self, sink: &mut OutputSink, ctx: &ActionContext) -> Result<(), TaskFailure>;
}

/// Collects the artifacts a task produces.
#[derive(Debug, Default)]
pub struct OutputSink {
    artifacts: Vec<Artifact>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.artifacts.push(Artifact {
            name: sanitize_artifact_name(&name.into()),
            data: data.into(),
        });
    }

    pub fn push_text(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.push(name, Bytes::from(text.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn into_output(self) -> TaskOutput {
        TaskOutput {
            artifacts: self.artifacts,
        }
    }
}

/// Keep artifact names usable as archive entry names.
fn sanitize_artifact_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "output.bin".to_string()
    } else {
        cleaned
    }
}

/// What an action gets to work with.
#[derive(Clone)]
pub struct ActionContext {
    pub task_id: String,
    /// Session-wide cancellation signal
    pub cancel: CancellationToken,
    /// Spawned processes register here so a cancel can kill them
    pub processes: ProcessRegistry,
    /// Per-task directory for files written by external tools
    pub scratch_dir: PathBuf,
}

/// Terminal result of running one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl TaskOutcome {
    /// Cancelled before the underlying operation was started.
    pub fn cancelled_before_start() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            output: None,
            error: None,
            started_at: None,
            finished_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(failure: TaskFailure, started_at: Option<DateTime<Utc>>, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: None,
            error: Some(failure.to_string()),
            started_at,
            finished_at: Utc::now(),
            duration,
        }
    }
}

/// Runs task descriptors. Stateless; one instance is shared by all sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, descriptor: &TaskDescriptor, ctx: &ActionContext) -> TaskOutcome {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(task = %descriptor.id, "Cancelled before start");
            return TaskOutcome::cancelled_before_start();
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut sink = OutputSink::new();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            result = descriptor.action().execute(&mut sink, ctx) => Some(result),
        };

        let duration = clock.elapsed();
        let finished_at = Utc::now();

        match result {
            None => {
                tracing::debug!(task = %descriptor.id, "Cancelled while running");
                TaskOutcome {
                    status: TaskStatus::Cancelled,
                    output: None,
                    error: None,
                    started_at: Some(started_at),
                    finished_at,
                    duration,
                }
            }
            Some(Ok(())) => {
                let output = sink.into_output();
                tracing::debug!(
                    task = %descriptor.id,
                    artifacts = output.artifacts.len(),
                    bytes = output.total_bytes(),
                    duration_ms = duration.as_millis() as u64,
                    "Task succeeded"
                );
                TaskOutcome {
                    status: TaskStatus::Succeeded,
                    output: Some(output),
                    error: None,
                    started_at: Some(started_at),
                    finished_at,
                    duration,
                }
            }
            // A failure that raced with a cancel is usually the kill itself.
            Some(Err(_)) if ctx.cancel.is_cancelled() => TaskOutcome {
                status: TaskStatus::Cancelled,
                output: None,
                error: None,
                started_at: Some(started_at),
                finished_at,
                duration,
            },
            Some(Err(failure)) => {
                tracing::warn!(task = %descriptor.id, error = %failure, "Task failed");
                TaskOutcome::failed(failure, Some(started_at), duration)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{action_context, descriptor, Fail, Succeed, WaitForCancel};

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let task = descriptor("Echo", Succeed::text("hello"));

        let outcome = TaskExecutor::new().run(&task, &ctx).await;

        assert_eq!(outcome.status, TaskStatus::Succeeded);
        let output = outcome.output.unwrap();
        assert_eq!(output.artifacts[0].data, Bytes::from("hello"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let task = descriptor("Broken", Fail::new("resource gone"));

        let outcome = TaskExecutor::new().run(&task, &ctx).await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("resource gone"));
        assert!(outcome.output.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        ctx.cancel.cancel();
        let succeed = Succeed::text("never");
        let calls = succeed.calls();
        let task = descriptor("Skipped", succeed);

        let outcome = TaskExecutor::new().run(&task, &ctx).await;

        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert!(outcome.started_at.is_none());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let task = descriptor("Stuck", WaitForCancel::ignoring_signal());

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), TaskExecutor::new().run(&task, &ctx))
            .await
            .expect("executor must observe cancellation");
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert!(outcome.started_at.is_some());
    }

    #[test]
    fn test_artifact_names_are_flattened() {
        assert_eq!(sanitize_artifact_name("logs/System.evtx"), "logs_System.evtx");
        assert_eq!(sanitize_artifact_name(".."), "output.bin");
    }
}
