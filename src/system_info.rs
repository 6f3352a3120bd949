//! Host description embedded in every report.

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os_version: String,
    pub computer_name: String,
    pub username: String,
    pub is_elevated: bool,
    pub cpu_info: String,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
}

impl SystemInfo {
    /// Gather host facts. Blocking; call from `spawn_blocking` in async code.
    pub fn gather(is_elevated: bool) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );

        let os_version = System::long_os_version()
            .or_else(System::name)
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        let computer_name = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let cpu_info = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());

        Self {
            os_version,
            computer_name,
            username: current_username(),
            is_elevated,
            cpu_info,
            total_memory_gb: round_gb(sys.total_memory()),
            available_memory_gb: round_gb(sys.available_memory()),
        }
    }

    /// Gather on the blocking pool.
    pub async fn gather_async(is_elevated: bool) -> Self {
        match tokio::task::spawn_blocking(move || Self::gather(is_elevated)).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("System info collection panicked: {}", e);
                Self::unknown(is_elevated)
            }
        }
    }

    fn unknown(is_elevated: bool) -> Self {
        Self {
            os_version: std::env::consts::OS.to_string(),
            computer_name: "unknown".to_string(),
            username: current_username(),
            is_elevated,
            cpu_info: std::env::consts::ARCH.to_string(),
            total_memory_gb: 0.0,
            available_memory_gb: 0.0,
        }
    }
}

fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Bytes to GiB with two decimals.
fn round_gb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_gb() {
        assert_eq!(round_gb(0), 0.0);
        assert_eq!(round_gb(8 * 1024 * 1024 * 1024), 8.0);
        assert_eq!(round_gb(1536 * 1024 * 1024), 1.5);
    }

    #[test]
    fn test_gather_fills_fields() {
        let info = SystemInfo::gather(false);
        assert!(!info.os_version.is_empty());
        assert!(!info.cpu_info.is_empty());
        assert!(!info.is_elevated);
        assert!(info.available_memory_gb <= info.total_memory_gb);
    }
}
