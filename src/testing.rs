//! Scripted task actions and fixtures for unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cancel::ProcessRegistry;
use crate::catalog::{TaskCategory, TaskDescriptor};
use crate::config::Config;
use crate::error::TaskFailure;
use crate::executor::{ActionContext, OutputSink, TaskAction};
use crate::package::OutputFormat;
use crate::session::{Artifact, Session, TaskOutput, TaskStatus};

pub fn descriptor(name: &str, action: impl TaskAction + 'static) -> TaskDescriptor {
    TaskDescriptor::new(name, &format!("{} (test)", name), TaskCategory::Other, action)
}

pub fn action_context(dir: &Path) -> ActionContext {
    ActionContext {
        task_id: "test".to_string(),
        cancel: CancellationToken::new(),
        processes: ProcessRegistry::new(),
        scratch_dir: dir.join("scratch"),
    }
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        output_dir: dir.to_path_buf(),
        max_concurrency: 8,
        progress_buffer: 64,
        ..Config::default()
    }
}

/// Succeeds immediately with one text artifact.
pub struct Succeed {
    text: String,
    calls: Arc<AtomicUsize>,
}

impl Succeed {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl TaskAction for Succeed {
    async fn execute(&self, sink: &mut OutputSink, ctx: &ActionContext) -> Result<(), TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sink.push_text(format!("{}.txt", ctx.task_id), self.text.clone());
        Ok(())
    }
}

/// Fails immediately.
pub struct Fail {
    message: String,
}

impl Fail {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl TaskAction for Fail {
    async fn execute(&self, _sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        Err(TaskFailure::Other(self.message.clone()))
    }
}

/// Never finishes on its own and never looks at the cancel token, like a
/// hung external tool. Only the executor's cancel path can end it.
pub struct WaitForCancel;

impl WaitForCancel {
    pub fn ignoring_signal() -> Self {
        Self
    }
}

#[async_trait]
impl TaskAction for WaitForCancel {
    async fn execute(&self, _sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Blocks until opened, then succeeds.
pub struct Gate {
    open: CancellationToken,
}

impl Gate {
    pub fn new() -> (Self, CancellationToken) {
        let open = CancellationToken::new();
        (Self { open: open.clone() }, open)
    }
}

#[async_trait]
impl TaskAction for Gate {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        self.open.cancelled().await;
        sink.push_text("gate.txt", "opened");
        Ok(())
    }
}

/// Panics inside the action.
pub struct Panic(pub &'static str);

#[async_trait]
impl TaskAction for Panic {
    async fn execute(&self, _sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        panic!("{}", self.0);
    }
}

/// Sleeps, then succeeds.
pub struct Delay(pub Duration);

#[async_trait]
impl TaskAction for Delay {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        tokio::time::sleep(self.0).await;
        sink.push_text("delay.txt", "done");
        Ok(())
    }
}

/// A session whose tasks already have the given statuses, with fixed
/// timestamps. Succeeded tasks carry `<id>.txt` = `"<name> output"`, failed
/// ones the error `"<name> broke"`.
pub fn finished_session(format: OutputFormat, tasks: &[(&str, TaskStatus)]) -> Session {
    let descriptors: Vec<_> = tasks
        .iter()
        .map(|(name, _)| Arc::new(descriptor(name, Succeed::text(name))))
        .collect();
    let mut session = Session::new(Uuid::new_v4(), &descriptors, format);

    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    session.created_at = at;
    session.started_at = Some(at);

    for (state, (name, status)) in session.task_states.iter_mut().zip(tasks) {
        state.status = *status;
        match status {
            TaskStatus::Succeeded => {
                state.output = Some(TaskOutput {
                    artifacts: vec![Artifact {
                        name: format!("{}.txt", state.task_id),
                        data: format!("{} output", name).into(),
                    }],
                });
            }
            TaskStatus::Failed => state.error = Some(format!("{} broke", name)),
            _ => {}
        }
        if status.is_terminal() {
            state.started_at = Some(at);
            state.finished_at = Some(at);
            state.duration = Some(Duration::from_millis(5));
        }
    }

    session.status = session.derive_status();
    if session.status.is_terminal() {
        session.completed_at = Some(at);
    }
    session
}
