//! Error taxonomy for the session orchestrator.
//!
//! Creation-time errors reject the request outright and never leave a
//! session behind. Per-task failures are not errors at this level: they are
//! recorded as [`TaskFailure`] inside the task's state.

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum DiagError {
    #[error("Unknown task ids: {}", .0.join(", "))]
    UnknownTaskIds(Vec<String>),

    #[error("Task ids selected more than once: {}", .0.join(", "))]
    DuplicateTaskIds(Vec<String>),

    #[error("No tasks selected")]
    NoTasksSelected,

    #[error("Administrator privileges required for: {}", .0.join(", "))]
    ElevationRequired(Vec<String>),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Session {id} is not finished (status: {status})")]
    SessionNotTerminal { id: Uuid, status: SessionStatus },

    #[error("Session {0} is still running")]
    SessionBusy(Uuid),

    #[error("Session {id} was already started (status: {status})")]
    AlreadyStarted { id: Uuid, status: SessionStatus },

    #[error("Failed to package results: {0}")]
    Packaging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DiagResult<T> = Result<T, DiagError>;

/// Why a single task did not succeed. The `Display` form is what ends up in
/// `TaskState::error`.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("Failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("`{program}` exited with {}{}", exit_label(.code), stderr_suffix(.stderr))]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Missing resource: {0}")]
    MissingResource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl TaskFailure {
    /// Map a spawn error, calling out binaries that are simply not installed.
    pub fn spawn(program: &str, err: std::io::Error) -> Self {
        let reason = if err.kind() == std::io::ErrorKind::NotFound {
            format!("{} not found on this system", program)
        } else {
            err.to_string()
        };
        Self::Spawn {
            program: program.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_message() {
        let failure = TaskFailure::ExitStatus {
            program: "lsblk".to_string(),
            code: Some(2),
            stderr: "  permission denied\n".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "`lsblk` exited with exit code 2: permission denied"
        );

        let killed = TaskFailure::ExitStatus {
            program: "dmesg".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert_eq!(
            killed.to_string(),
            "`dmesg` exited with no exit code (terminated by signal)"
        );
    }

    #[test]
    fn test_spawn_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let failure = TaskFailure::spawn("dxdiag", err);
        assert_eq!(
            failure.to_string(),
            "Failed to start `dxdiag`: dxdiag not found on this system"
        );
    }

    #[test]
    fn test_unknown_ids_message_lists_ids() {
        let err = DiagError::UnknownTaskIds(vec!["foo".to_string(), "bar".to_string()]);
        assert_eq!(err.to_string(), "Unknown task ids: foo, bar");
    }
}
