//! Session scheduler.
//!
//! Each session is owned by one actor task that is the only writer of its
//! [`Session`]. Task runners never touch the state: they report
//! `Started`/`Finished` events over the session's command channel, and the
//! actor applies them, derives the session status and publishes a progress
//! snapshot for every transition.
//!
//! Tasks are admitted through a process-wide fair semaphore. One dispatcher
//! per session acquires permits in selection order, so admission is FIFO and
//! stops as soon as the session is cancelled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use super::progress::{ProgressHub, ProgressSnapshot, ProgressStream};
use super::{Session, SessionStatus, TaskStatus};
use crate::cancel::CancellationController;
use crate::catalog::{duplicate_ids, TaskCatalog, TaskDescriptor};
use crate::config::Config;
use crate::error::{DiagError, DiagResult, TaskFailure};
use crate::executor::{ActionContext, TaskExecutor, TaskOutcome};
use crate::package::{OutputFormat, PackagedOutput, ResultPackager};
use crate::privilege::PrivilegeRef;
use crate::system_info::SystemInfo;

/// Capacity of a session's command channel.
const COMMAND_BUFFER: usize = 64;

/// How often the sweeper looks for expired sessions.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

enum SessionCommand {
    Start {
        respond: oneshot::Sender<DiagResult<SessionStatus>>,
    },
    Cancel {
        respond: oneshot::Sender<SessionStatus>,
    },
    Task(TaskEvent),
}

/// Reported by task runners; `index` is the task's position in the selection.
enum TaskEvent {
    Started { index: usize, at: DateTime<Utc> },
    Finished { index: usize, outcome: TaskOutcome },
}

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Status report of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub status: SessionStatus,
    pub progress: f64,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub current_tasks: Vec<String>,
    pub errors: Vec<String>,
    pub output_format: OutputFormat,
    pub output_location: Option<PathBuf>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            status: session.status,
            progress: session.progress(),
            completed_tasks: session.completed_count(),
            total_tasks: session.task_states.len(),
            current_tasks: session.current_tasks(),
            errors: session.errors(),
            output_format: session.output_format,
            output_location: session.output_location.clone(),
            cancel_requested: session.cancel_requested,
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

struct SessionHandle {
    id: Uuid,
    descriptors: Vec<Arc<TaskDescriptor>>,
    state: RwLock<Session>,
    progress: ProgressHub,
    cancel: CancellationController,
    cmd_tx: mpsc::Sender<SessionCommand>,
    /// Packaged output per format; only filled once the session is terminal
    packages: Mutex<HashMap<OutputFormat, PackagedOutput>>,
    scratch_dir: PathBuf,
}

/// Shared by every session actor.
#[derive(Clone)]
struct Runtime {
    executor: TaskExecutor,
    packager: ResultPackager,
    workers: Arc<Semaphore>,
    privilege: PrivilegeRef,
    output_dir: PathBuf,
}

pub struct SessionScheduler {
    catalog: Arc<TaskCatalog>,
    runtime: Runtime,
    retention: Duration,
    progress_buffer: usize,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionScheduler {
    pub fn new(catalog: Arc<TaskCatalog>, privilege: PrivilegeRef, config: &Config) -> Self {
        Self {
            catalog,
            runtime: Runtime {
                executor: TaskExecutor::new(),
                packager: ResultPackager::new(),
                workers: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                privilege,
                output_dir: config.output_dir.clone(),
            },
            retention: config.session_retention,
            progress_buffer: config.progress_buffer,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<TaskCatalog> {
        &self.catalog
    }

    pub fn is_elevated(&self) -> bool {
        self.runtime.privilege.is_elevated()
    }

    /// Create a `Pending` session for `selected`, in that order.
    ///
    /// Rejected selections leave nothing behind.
    pub async fn create(&self, selected: Vec<String>, format: OutputFormat) -> DiagResult<Session> {
        if selected.is_empty() {
            return Err(DiagError::NoTasksSelected);
        }
        let duplicates = duplicate_ids(&selected);
        if !duplicates.is_empty() {
            return Err(DiagError::DuplicateTaskIds(duplicates));
        }
        let descriptors = self.catalog.resolve(&selected)?;
        if !self.is_elevated() {
            let gated: Vec<String> = descriptors
                .iter()
                .filter(|d| d.requires_elevation)
                .map(|d| d.id.clone())
                .collect();
            if !gated.is_empty() {
                return Err(DiagError::ElevationRequired(gated));
            }
        }

        let id = Uuid::new_v4();
        let session = Session::new(id, &descriptors, format);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = Arc::new(SessionHandle {
            id,
            progress: ProgressHub::for_session(self.progress_buffer, descriptors.len()),
            descriptors,
            state: RwLock::new(session.clone()),
            cancel: CancellationController::new(),
            cmd_tx,
            packages: Mutex::new(HashMap::new()),
            scratch_dir: self.runtime.output_dir.join("sessions").join(id.to_string()),
        });

        let actor = SessionActor {
            handle: handle.clone(),
            runtime: self.runtime.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        self.sessions.write().await.insert(id, handle);
        tracing::info!(
            session_id = %id,
            tasks = session.task_states.len(),
            format = %format,
            "Created session"
        );
        Ok(session)
    }

    /// Dispatch every task of a `Pending` session.
    pub async fn start(&self, id: Uuid) -> DiagResult<SessionStatus> {
        let handle = self.handle(id).await?;
        let (tx, rx) = oneshot::channel();
        if handle
            .cmd_tx
            .send(SessionCommand::Start { respond: tx })
            .await
            .is_err()
        {
            // The actor only exits once the session is terminal.
            let status = handle.state.read().await.status;
            return Err(DiagError::AlreadyStarted { id, status });
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                let status = handle.state.read().await.status;
                Err(DiagError::AlreadyStarted { id, status })
            }
        }
    }

    pub async fn create_and_start(&self, selected: Vec<String>, format: OutputFormat) -> DiagResult<Session> {
        let session = self.create(selected, format).await?;
        self.start(session.id).await?;
        self.session(session.id).await
    }

    /// Request cancellation. Idempotent: on a terminal session this only
    /// reports the current status.
    pub async fn cancel(&self, id: Uuid) -> DiagResult<SessionStatus> {
        let handle = self.handle(id).await?;
        let (tx, rx) = oneshot::channel();
        if handle
            .cmd_tx
            .send(SessionCommand::Cancel { respond: tx })
            .await
            .is_ok()
        {
            if let Ok(status) = rx.await {
                return Ok(status);
            }
        }
        let status = handle.state.read().await.status;
        Ok(status)
    }

    /// Cancel every non-terminal session. Returns how many were asked.
    pub async fn cancel_all(&self) -> usize {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut cancelled = 0;
        for handle in handles {
            if handle.state.read().await.status.is_terminal() {
                continue;
            }
            if let Ok(status) = self.cancel(handle.id).await {
                tracing::info!(session_id = %handle.id, status = %status, "Cancelled session");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Full copy of a session's current state.
    pub async fn session(&self, id: Uuid) -> DiagResult<Session> {
        let handle = self.handle(id).await?;
        let session = handle.state.read().await.clone();
        Ok(session)
    }

    pub async fn status(&self, id: Uuid) -> DiagResult<SessionSummary> {
        let handle = self.handle(id).await?;
        let state = handle.state.read().await;
        Ok(SessionSummary::from(&*state))
    }

    pub async fn snapshot(&self, id: Uuid) -> DiagResult<ProgressSnapshot> {
        let handle = self.handle(id).await?;
        let state = handle.state.read().await;
        Ok(state.snapshot())
    }

    /// Summaries of all live sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(SessionSummary::from(&*handle.state.read().await));
        }
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Current snapshot followed by every later one, ending after the
    /// terminal snapshot.
    pub async fn subscribe(&self, id: Uuid) -> DiagResult<ProgressStream> {
        let handle = self.handle(id).await?;
        // Snapshots are published under the write lock; holding the read
        // lock here means none can slip between `current` and the receiver.
        let state = handle.state.read().await;
        Ok(handle.progress.subscribe_from(state.snapshot()))
    }

    /// Resolve once the session is terminal, with its final snapshot.
    pub async fn wait_terminal(&self, id: Uuid) -> DiagResult<ProgressSnapshot> {
        let mut stream = self.subscribe(id).await?;
        let mut last = None;
        while let Some(snapshot) = stream.next().await {
            last = Some(snapshot);
        }
        match last {
            Some(snapshot) if snapshot.is_terminal() => Ok(snapshot),
            _ => self.snapshot(id).await,
        }
    }

    /// Package a terminal session. `format` defaults to the session's own.
    pub async fn package(&self, id: Uuid, format: Option<OutputFormat>) -> DiagResult<PackagedOutput> {
        let handle = self.handle(id).await?;
        let state = handle.state.read().await;
        if !state.status.is_terminal() {
            return Err(DiagError::SessionNotTerminal {
                id,
                status: state.status,
            });
        }

        let format = format.unwrap_or(state.output_format);
        let mut packages = handle.packages.lock().await;
        if let Some(packaged) = packages.get(&format) {
            return Ok(packaged.clone());
        }
        let packaged = self.runtime.packager.package(&state, format)?;
        packages.insert(format, packaged.clone());
        Ok(packaged)
    }

    /// Explicitly drop a session and its scratch files. A session that was
    /// never started is cancelled first; a running one is refused.
    pub async fn remove(&self, id: Uuid) -> DiagResult<()> {
        let handle = self.handle(id).await?;
        let status = handle.state.read().await.status;
        let status = match status {
            SessionStatus::Pending => self.cancel(id).await?,
            status => status,
        };
        if !status.is_terminal() {
            return Err(DiagError::SessionBusy(id));
        }
        self.sessions.write().await.remove(&id);
        remove_scratch_dir(&handle).await;
        tracing::info!(session_id = %id, "Removed session");
        Ok(())
    }

    /// Evict terminal sessions older than the retention window, and sessions
    /// created that long ago but never started.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let age = |at: DateTime<Utc>| (now - at).to_std().unwrap_or(Duration::ZERO);
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        let mut abandoned = Vec::new();
        for handle in handles {
            let state = handle.state.read().await;
            match (state.status, state.completed_at) {
                (SessionStatus::Pending, _) if age(state.created_at) >= self.retention => {
                    abandoned.push(handle.clone());
                }
                (status, Some(completed_at)) if status.is_terminal() && age(completed_at) >= self.retention => {
                    expired.push(handle.clone());
                }
                _ => {}
            }
        }

        for handle in abandoned {
            if let Ok(status) = self.cancel(handle.id).await {
                if status.is_terminal() {
                    expired.push(handle);
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }
        {
            let mut sessions = self.sessions.write().await;
            for handle in &expired {
                sessions.remove(&handle.id);
            }
        }
        for handle in &expired {
            remove_scratch_dir(handle).await;
        }
        tracing::info!("Evicted {} expired sessions", expired.len());
        expired.len()
    }

    /// Background task that evicts expired sessions.
    pub fn start_cleanup_task(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                self.evict_expired().await;
            }
        });
    }

    async fn handle(&self, id: Uuid) -> DiagResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DiagError::SessionNotFound(id))
    }
}

async fn remove_scratch_dir(handle: &SessionHandle) {
    match tokio::fs::remove_dir_all(&handle.scratch_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            session_id = %handle.id,
            "Failed to remove scratch dir {}: {}",
            handle.scratch_dir.display(),
            e
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session actor
// ─────────────────────────────────────────────────────────────────────────────

struct SessionActor {
    handle: Arc<SessionHandle>,
    runtime: Runtime,
}

impl SessionActor {
    async fn run(self, mut rx: mpsc::Receiver<SessionCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::Start { respond } => {
                    let result = self.start().await;
                    let _ = respond.send(result);
                }
                SessionCommand::Cancel { respond } => {
                    let status = self.cancel().await;
                    let _ = respond.send(status);
                }
                SessionCommand::Task(event) => self.apply(event).await,
            }

            if self.handle.state.read().await.status.is_terminal() {
                break;
            }
        }
        tracing::debug!(session_id = %self.handle.id, "Session actor stopped");
    }

    async fn start(&self) -> DiagResult<SessionStatus> {
        let id = self.handle.id;
        {
            let state = self.handle.state.read().await;
            if state.status != SessionStatus::Pending {
                return Err(DiagError::AlreadyStarted {
                    id,
                    status: state.status,
                });
            }
        }

        let system_info = SystemInfo::gather_async(self.runtime.privilege.is_elevated()).await;
        let scratch = tokio::fs::create_dir_all(&self.handle.scratch_dir).await;

        let mut state = self.handle.state.write().await;
        state.system_info = Some(system_info);
        state.started_at = Some(Utc::now());

        if let Err(e) = scratch {
            let message = format!(
                "Failed to create scratch directory {}: {}",
                self.handle.scratch_dir.display(),
                e
            );
            tracing::error!(session_id = %id, "{}", message);
            state.failure = Some(message);
            let now = Utc::now();
            for task in state.task_states.iter_mut() {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(now);
            }
            self.finish(&mut state).await;
            return Ok(state.status);
        }

        state.status = SessionStatus::Running;
        self.publish(&mut state);
        tracing::info!(session_id = %id, tasks = state.task_states.len(), "Session started");

        tokio::spawn(dispatch(self.handle.clone(), self.runtime.clone()));
        Ok(state.status)
    }

    async fn cancel(&self) -> SessionStatus {
        let mut state = self.handle.state.write().await;
        let status = state.status;
        match status {
            SessionStatus::Pending => {
                state.cancel_requested = true;
                self.handle.cancel.request_cancel();
                let now = Utc::now();
                for task in state.task_states.iter_mut() {
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(now);
                }
                self.finish(&mut state).await;
            }
            SessionStatus::Running => {
                if !state.cancel_requested {
                    state.cancel_requested = true;
                    tracing::info!(
                        session_id = %self.handle.id,
                        running = state.count(TaskStatus::Running),
                        "Cancelling session"
                    );
                    self.handle.cancel.request_cancel();
                }
            }
            _ => {}
        }
        state.status
    }

    async fn apply(&self, event: TaskEvent) {
        let mut state = self.handle.state.write().await;
        if state.status.is_terminal() {
            return;
        }

        match event {
            TaskEvent::Started { index, at } => {
                let Some(task) = state.task_states.get_mut(index) else {
                    return;
                };
                if task.status != TaskStatus::Pending {
                    return;
                }
                task.status = TaskStatus::Running;
                task.started_at = Some(at);
                tracing::debug!(session_id = %self.handle.id, task = %task.task_id, "Task started");
            }
            TaskEvent::Finished { index, outcome } => {
                let Some(task) = state.task_states.get_mut(index) else {
                    return;
                };
                if task.status.is_terminal() {
                    tracing::warn!(
                        session_id = %self.handle.id,
                        task = %task.task_id,
                        "Ignoring second terminal report"
                    );
                    return;
                }
                task.status = outcome.status;
                task.output = outcome.output;
                task.error = outcome.error;
                task.started_at = outcome.started_at.or(task.started_at);
                task.finished_at = Some(outcome.finished_at);
                task.duration = Some(outcome.duration);
                tracing::debug!(
                    session_id = %self.handle.id,
                    task = %task.task_id,
                    status = %task.status,
                    "Task finished"
                );
            }
        }

        if state.all_terminal() {
            self.finish(&mut state).await;
        } else {
            self.publish(&mut state);
        }
    }

    /// Settle the final status, write the bundle of a completed session and
    /// publish the terminal snapshot.
    async fn finish(&self, state: &mut Session) {
        state.status = state.derive_status();
        state.completed_at = Some(Utc::now());

        if state.status == SessionStatus::Completed {
            match self.runtime.packager.package(state, state.output_format) {
                Ok(packaged) => match packaged.write_to(&self.runtime.output_dir).await {
                    Ok(path) => {
                        state.output_location = Some(path);
                        self.handle
                            .packages
                            .lock()
                            .await
                            .insert(packaged.format, packaged);
                    }
                    Err(e) => tracing::warn!(
                        session_id = %self.handle.id,
                        "Failed to write bundle {}: {}",
                        packaged.file_name,
                        e
                    ),
                },
                Err(e) => tracing::warn!(session_id = %self.handle.id, "Failed to package results: {}", e),
            }
        }

        tracing::info!(
            session_id = %self.handle.id,
            status = %state.status,
            succeeded = state.count(TaskStatus::Succeeded),
            failed = state.count(TaskStatus::Failed),
            cancelled = state.count(TaskStatus::Cancelled),
            "Session finished"
        );
        self.publish(state);
    }

    fn publish(&self, state: &mut Session) {
        state.sequence += 1;
        self.handle.progress.publish(state.snapshot());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Admit the session's tasks in selection order. Once the session is
/// cancelled, nothing else is started and every undispatched task is
/// reported cancelled.
async fn dispatch(handle: Arc<SessionHandle>, runtime: Runtime) {
    let token = handle.cancel.token();

    for (index, descriptor) in handle.descriptors.iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = runtime.workers.clone().acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            for rest in index..handle.descriptors.len() {
                report(
                    &handle.cmd_tx,
                    TaskEvent::Finished {
                        index: rest,
                        outcome: TaskOutcome::cancelled_before_start(),
                    },
                )
                .await;
            }
            return;
        };

        let ctx = ActionContext {
            task_id: descriptor.id.clone(),
            cancel: token.clone(),
            processes: handle.cancel.processes().clone(),
            scratch_dir: handle.scratch_dir.join(&descriptor.id),
        };
        tokio::spawn(run_one(
            index,
            descriptor.clone(),
            ctx,
            runtime.executor,
            handle.cmd_tx.clone(),
            permit,
        ));
    }
}

async fn run_one(
    index: usize,
    descriptor: Arc<TaskDescriptor>,
    ctx: ActionContext,
    executor: TaskExecutor,
    events: mpsc::Sender<SessionCommand>,
    _permit: OwnedSemaphorePermit,
) {
    if ctx.cancel.is_cancelled() {
        let outcome = TaskOutcome::cancelled_before_start();
        report(&events, TaskEvent::Finished { index, outcome }).await;
        return;
    }

    let started_at = Utc::now();
    let clock = Instant::now();
    report(&events, TaskEvent::Started { index, at: started_at }).await;

    // A panicking action must still produce exactly one terminal report.
    let task_descriptor = descriptor.clone();
    let outcome = match tokio::spawn(async move { executor.run(&task_descriptor, &ctx).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(task = %descriptor.id, "Task runner crashed: {}", e);
            TaskOutcome::failed(
                TaskFailure::Panicked(panic_message(e)),
                Some(started_at),
                clock.elapsed(),
            )
        }
    };

    report(&events, TaskEvent::Finished { index, outcome }).await;
}

async fn report(events: &mpsc::Sender<SessionCommand>, event: TaskEvent) {
    if events.send(SessionCommand::Task(event)).await.is_err() {
        tracing::debug!("Session actor gone, dropping task event");
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
