//! Session-scoped cancellation.
//!
//! A cancel request does two things: it fires the session's
//! [`CancellationToken`], which every executor of the session races against,
//! and it force-kills every external process the session's tasks still have
//! registered. Killing happens first so helpers that spawned their own
//! children (and would survive a dropped handle) are taken down as a group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// An external process spawned by a task and still believed alive.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrackedProcess {
    pub task_id: String,
    pub program: String,
    pub pid: u32,
}

/// Processes spawned by one session's tasks.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_key: AtomicU64,
    processes: Mutex<HashMap<u64, TrackedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned process. The guard untracks it on drop and,
    /// unless [`ProcessGuard::mark_exited`] was called, kills it first.
    pub fn register(&self, task_id: &str, program: &str, pid: u32) -> ProcessGuard {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let process = TrackedProcess {
            task_id: task_id.to_string(),
            program: program.to_string(),
            pid,
        };
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.insert(key, process);
        }
        ProcessGuard {
            registry: self.clone(),
            key,
            pid,
            exited: false,
        }
    }

    pub fn list(&self) -> Vec<TrackedProcess> {
        match self.inner.processes.lock() {
            Ok(processes) => {
                let mut list: Vec<_> = processes.values().cloned().collect();
                list.sort_by_key(|p| p.pid);
                list
            }
            Err(_) => Vec::new(),
        }
    }

    /// Force-kill everything still tracked. Returns how many kills were sent.
    pub fn kill_all(&self) -> usize {
        let processes = self.list();
        for process in &processes {
            tracing::info!(
                task = %process.task_id,
                program = %process.program,
                pid = process.pid,
                "Killing helper process"
            );
            kill_process_tree(process.pid);
        }
        processes.len()
    }

    fn untrack(&self, key: u64) {
        if let Ok(mut processes) = self.inner.processes.lock() {
            processes.remove(&key);
        }
    }
}

/// Keeps a spawned process tracked for as long as the task holds it.
#[derive(Debug)]
pub struct ProcessGuard {
    registry: ProcessRegistry,
    key: u64,
    pid: u32,
    exited: bool,
}

impl ProcessGuard {
    /// The process has been waited on; its pid must not be signalled anymore.
    pub fn mark_exited(&mut self) {
        self.exited = true;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.registry.untrack(self.key);
        if !self.exited {
            // Dropped mid-flight (task cancelled): take the whole tree down.
            kill_process_tree(self.pid);
        }
    }
}

/// Commands are spawned as process-group leaders, so the group id is the pid.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a stale group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, error = %err, "Failed to kill process group");
        }
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = result {
        tracing::warn!(pid, error = %e, "Failed to run taskkill");
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) {}

/// Cancellation handle of one session.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
    processes: ProcessRegistry,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Kill tracked helpers, then signal every executor of the session.
    /// Calling it again is harmless.
    pub fn request_cancel(&self) {
        let killed = self.processes.kill_all();
        if killed > 0 {
            tracing::info!(killed, "Terminated helper processes on cancel");
        }
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_untracks_on_drop() {
        let registry = ProcessRegistry::new();
        let mut guard = registry.register("kernel", "uname", u32::MAX);
        assert_eq!(registry.list().len(), 1);
        guard.mark_exited();
        drop(guard);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_request_cancel_fires_token() {
        let controller = CancellationController::new();
        let token = controller.token();
        assert!(!token.is_cancelled());
        controller.request_cancel();
        controller.request_cancel();
        assert!(token.is_cancelled());
        assert!(controller.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_all_terminates_process_group() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let controller = CancellationController::new();
        let mut guard = controller
            .processes()
            .register("sleeper", "sleep", child.id().unwrap());

        controller.request_cancel();

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("process should die promptly")
            .unwrap();
        guard.mark_exited();
        assert!(!status.success());
    }
}
