//! In-process collectors: host files, crash-dump directories and `sysinfo`
//! queries. Blocking work runs on the blocking pool so a slow filesystem
//! never stalls progress reporting.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use sysinfo::{Disks, System};
use walkdir::WalkDir;

use super::{ActionContext, OutputSink, TaskAction};
use crate::error::TaskFailure;
use crate::system_info::SystemInfo;

/// Copy one host file as an artifact.
#[derive(Debug, Clone)]
pub struct FileAction {
    path: PathBuf,
    artifact: String,
}

impl FileAction {
    pub fn new(path: impl Into<PathBuf>, artifact: &str) -> Self {
        Self {
            path: path.into(),
            artifact: artifact.to_string(),
        }
    }
}

#[async_trait]
impl TaskAction for FileAction {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                sink.push(self.artifact.clone(), data);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TaskFailure::MissingResource(
                format!("{} does not exist", self.path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Collect the newest files with a given extension from a directory
/// (crash dumps and the like).
#[derive(Debug, Clone)]
pub struct DirectoryAction {
    dir: PathBuf,
    extension: String,
    newest: usize,
}

impl DirectoryAction {
    pub fn new(dir: impl Into<PathBuf>, extension: &str, newest: usize) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
            newest,
        }
    }

    /// Paths of the `newest` matching files, most recent first.
    fn select(&self) -> Result<Vec<PathBuf>, TaskFailure> {
        if !self.dir.is_dir() {
            return Err(TaskFailure::MissingResource(format!(
                "{} does not exist",
                self.dir.display()
            )));
        }

        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry in {}: {}", self.dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&self.extension))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, entry.into_path()));
        }

        // Newest first; ties broken by path so the selection is stable.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(candidates
            .into_iter()
            .take(self.newest)
            .map(|(_, path)| path)
            .collect())
    }
}

#[async_trait]
impl TaskAction for DirectoryAction {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        let this = self.clone();
        let selected = tokio::task::spawn_blocking(move || this.select())
            .await
            .map_err(|e| TaskFailure::Panicked(e.to_string()))??;

        if selected.is_empty() {
            sink.push_text(
                "none_found.txt",
                format!("No .{} files in {}\n", self.extension, self.dir.display()),
            );
            return Ok(());
        }

        for path in selected {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let data = tokio::fs::read(&path).await?;
            sink.push(name, data);
        }
        Ok(())
    }
}

/// Snapshot of running processes, sorted by pid.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessListAction;

#[async_trait]
impl TaskAction for ProcessListAction {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        let text = tokio::task::spawn_blocking(render_process_list)
            .await
            .map_err(|e| TaskFailure::Panicked(e.to_string()))?;
        sink.push_text("processes.txt", text);
        Ok(())
    }
}

fn render_process_list() -> String {
    let sys = System::new_all();
    let mut processes: Vec<_> = sys.processes().values().collect();
    processes.sort_by_key(|p| p.pid().as_u32());

    let mut out = format!("{:>8}  {:>12}  {:<10}  {}\n", "PID", "MEMORY_KB", "STATUS", "NAME");
    for process in processes {
        let _ = writeln!(
            out,
            "{:>8}  {:>12}  {:<10}  {}",
            process.pid().as_u32(),
            process.memory() / 1024,
            process.status().to_string(),
            process.name().to_string_lossy()
        );
    }
    out
}

/// Plain-text overview of the host: OS, CPU, memory and mounted disks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSummaryAction;

#[async_trait]
impl TaskAction for SystemSummaryAction {
    async fn execute(&self, sink: &mut OutputSink, _ctx: &ActionContext) -> Result<(), TaskFailure> {
        let text = tokio::task::spawn_blocking(render_system_summary)
            .await
            .map_err(|e| TaskFailure::Panicked(e.to_string()))?;
        sink.push_text("system_summary.txt", text);
        Ok(())
    }
}

fn render_system_summary() -> String {
    let info = SystemInfo::gather(false);
    let sys = System::new_all();
    let mut out = String::new();

    let _ = writeln!(out, "OS:               {}", info.os_version);
    if let Some(kernel) = System::kernel_version() {
        let _ = writeln!(out, "Kernel:           {}", kernel);
    }
    let _ = writeln!(out, "Computer name:    {}", info.computer_name);
    let _ = writeln!(out, "User:             {}", info.username);
    let _ = writeln!(out, "CPU:              {}", info.cpu_info);
    let _ = writeln!(out, "Logical cores:    {}", sys.cpus().len());
    let _ = writeln!(out, "Total memory:     {:.2} GB", info.total_memory_gb);
    let _ = writeln!(out, "Available memory: {:.2} GB", info.available_memory_gb);
    let _ = writeln!(out, "Uptime:           {} s", System::uptime());

    let disks = Disks::new_with_refreshed_list();
    if !disks.list().is_empty() {
        let _ = writeln!(out, "\nDisks:");
        for disk in disks.list() {
            let _ = writeln!(
                out,
                "  {} on {} ({}): {} / {} bytes free",
                disk.name().to_string_lossy(),
                disk.mount_point().display(),
                disk.file_system().to_string_lossy(),
                disk.available_space(),
                disk.total_space()
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::action_context;
    use std::time::Duration;

    #[tokio::test]
    async fn test_file_action_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        FileAction::new(&path, "hosts.txt").execute(&mut sink, &ctx).await.unwrap();

        let output = sink.into_output();
        assert_eq!(output.artifacts[0].name, "hosts.txt");
        assert_eq!(&output.artifacts[0].data[..], b"127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        let err = FileAction::new(dir.path().join("absent"), "x.txt")
            .execute(&mut sink, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskFailure::MissingResource(_)));
    }

    #[tokio::test]
    async fn test_directory_action_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let dumps = dir.path().join("Minidump");
        std::fs::create_dir(&dumps).unwrap();
        for name in ["a.dmp", "b.dmp", "c.DMP", "d.dmp"] {
            std::fs::write(dumps.join(name), name).unwrap();
            // Distinct mtimes on coarse filesystems.
            std::thread::sleep(Duration::from_millis(20));
        }
        std::fs::write(dumps.join("notes.txt"), "ignored").unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        DirectoryAction::new(&dumps, "dmp", 3)
            .execute(&mut sink, &ctx)
            .await
            .unwrap();

        let names: Vec<_> = sink.into_output().artifacts.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["d.dmp", "c.DMP", "b.dmp"]);
    }

    #[tokio::test]
    async fn test_empty_directory_succeeds_with_note() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        DirectoryAction::new(dir.path(), ".dmp", 3)
            .execute(&mut sink, &ctx)
            .await
            .unwrap();

        let output = sink.into_output();
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].name, "none_found.txt");
    }

    #[tokio::test]
    async fn test_missing_directory_is_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        let err = DirectoryAction::new(dir.path().join("nope"), "dmp", 3)
            .execute(&mut sink, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskFailure::MissingResource(_)));
    }

    #[tokio::test]
    async fn test_process_list_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let mut sink = OutputSink::new();

        ProcessListAction.execute(&mut sink, &ctx).await.unwrap();

        let output = sink.into_output();
        let text = String::from_utf8_lossy(&output.artifacts[0].data).to_string();
        assert!(text.starts_with(&format!("{:>8}", "PID")));
        assert!(text.lines().count() > 1);
    }
}
