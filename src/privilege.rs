//! Elevation check.
//!
//! The orchestrator only needs to know whether the current process runs
//! with administrator/root rights. The check runs once and is then read.

use std::sync::Arc;

pub trait PrivilegeContext: Send + Sync {
    fn is_elevated(&self) -> bool;
}

pub type PrivilegeRef = Arc<dyn PrivilegeContext>;

/// Privilege state of the running process, captured at construction.
#[derive(Debug, Clone, Copy)]
pub struct HostPrivilege {
    elevated: bool,
}

impl HostPrivilege {
    pub fn detect() -> Self {
        let elevated = is_running_elevated();
        tracing::debug!(elevated, "Detected process privileges");
        Self { elevated }
    }
}

impl PrivilegeContext for HostPrivilege {
    fn is_elevated(&self) -> bool {
        self.elevated
    }
}

/// Fixed privilege answer, for callers that already know (and for tests).
#[derive(Debug, Clone, Copy)]
pub struct StaticPrivilege(pub bool);

impl PrivilegeContext for StaticPrivilege {
    fn is_elevated(&self) -> bool {
        self.0
    }
}

#[cfg(unix)]
fn is_running_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(windows)]
fn is_running_elevated() -> bool {
    // `net session` is refused with "access denied" unless the token is elevated.
    std::process::Command::new("net")
        .arg("session")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn is_running_elevated() -> bool {
    false
}
