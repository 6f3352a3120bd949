//! External command steps.
//!
//! Each spawned process gets its own process group (Unix), piped output,
//! `kill_on_drop`, and a [`ProcessGuard`](crate::cancel::ProcessGuard) in the
//! session's registry. When the task is cancelled the future driving the
//! command is dropped and the guard kills the whole group, so helpers that
//! fork (dxdiag, powercfg, journalctl pagers) don't outlive the session.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{ActionContext, OutputSink, TaskAction};
use crate::error::TaskFailure;

/// Placeholder in step arguments replaced by the path of the step's output file.
pub const OUT_PLACEHOLDER: &str = "{out}";

/// Max stderr characters kept in a failure message.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Where a step's artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Capture {
    /// The process' stdout, stored under this artifact name
    Stdout(String),
    /// A file the tool writes to `{out}`, stored under this artifact name
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandStep {
    program: String,
    args: Vec<String>,
    capture: Capture,
}

impl CommandStep {
    /// Run `program args..` and keep stdout as `artifact`.
    pub fn stdout(program: &str, args: &[&str], artifact: &str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            capture: Capture::Stdout(artifact.to_string()),
        }
    }

    /// Run a tool that writes its report to a path given on the command line
    /// (`{out}` in `args`) and keep that file as `artifact`.
    pub fn file(program: &str, args: &[&str], artifact: &str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            capture: Capture::File(artifact.to_string()),
        }
    }

    fn artifact_name(&self) -> &str {
        match &self.capture {
            Capture::Stdout(name) | Capture::File(name) => name,
        }
    }

    fn resolved_args(&self, out_path: &Path) -> Vec<String> {
        let out = out_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(OUT_PLACEHOLDER, &out))
            .collect()
    }
}

/// One or more command steps executed in order; the first failure stops the task.
#[derive(Debug, Clone)]
pub struct CommandAction {
    steps: Vec<CommandStep>,
}

impl CommandAction {
    pub fn new(step: CommandStep) -> Self {
        Self { steps: vec![step] }
    }

    /// Shorthand for a single stdout-capturing step.
    pub fn stdout(program: &str, args: &[&str], artifact: &str) -> Self {
        Self::new(CommandStep::stdout(program, args, artifact))
    }

    pub fn then(mut self, step: CommandStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[CommandStep] {
        &self.steps
    }
}

#[async_trait]
impl TaskAction for CommandAction {
    async fn execute(&self, sink: &mut OutputSink, ctx: &ActionContext) -> Result<(), TaskFailure> {
        for step in &self.steps {
            run_step(step, sink, ctx).await?;
        }
        Ok(())
    }
}

async fn run_step(step: &CommandStep, sink: &mut OutputSink, ctx: &ActionContext) -> Result<(), TaskFailure> {
    let out_path = ctx.scratch_dir.join(step.artifact_name());
    if matches!(step.capture, Capture::File(_)) {
        tokio::fs::create_dir_all(&ctx.scratch_dir).await?;
    }

    let args = step.resolved_args(&out_path);
    tracing::debug!(task = %ctx.task_id, program = %step.program, ?args, "Running command");

    let output = run_command(&step.program, &args, ctx).await?;

    if !output.status.success() {
        return Err(TaskFailure::ExitStatus {
            program: step.program.clone(),
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        });
    }

    match &step.capture {
        Capture::Stdout(name) => sink.push(name.clone(), output.stdout),
        Capture::File(name) => {
            let data = read_written_file(&out_path, &step.program).await?;
            sink.push(name.clone(), data);
        }
    }
    Ok(())
}

struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Spawn `program` and collect its output. The returned future may be
/// dropped at any point; the process is then killed.
async fn run_command(program: &str, args: &[String], ctx: &ActionContext) -> Result<CommandOutput, TaskFailure> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| TaskFailure::spawn(program, e))?;
    let pid = child
        .id()
        .ok_or_else(|| TaskFailure::Other(format!("`{}` exited before it could be tracked", program)))?;
    let mut guard = ctx.processes.register(&ctx.task_id, program, pid);

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let result = tokio::try_join!(child.wait(), read_stdout, read_stderr);
    guard.mark_exited();
    let (status, stdout, stderr) = result?;

    Ok(CommandOutput { status, stdout, stderr })
}

async fn read_written_file(path: &PathBuf, program: &str) -> Result<Vec<u8>, TaskFailure> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TaskFailure::MissingResource(
            format!("`{}` did not write {}", program, path.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Last part of stderr, decoded lossily and stripped of control characters.
fn stderr_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let cleaned: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect();
    let count = cleaned.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return cleaned;
    }
    let tail: String = cleaned.chars().skip(count - STDERR_TAIL_CHARS).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::action_context;

    #[test]
    fn test_out_placeholder_is_substituted() {
        let step = CommandStep::file("dxdiag", &["/t", "{out}", "/whql:off"], "DxDiag.txt");
        let args = step.resolved_args(Path::new("/scratch/DxDiag.txt"));
        assert_eq!(args, vec!["/t", "/scratch/DxDiag.txt", "/whql:off"]);
    }

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL_CHARS + 10) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("END"));
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS + 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let action = CommandAction::stdout("sh", &["-c", "printf 'cpu info'"], "lscpu.txt");
        let mut sink = OutputSink::new();

        action.execute(&mut sink, &ctx).await.unwrap();

        let output = sink.into_output();
        assert_eq!(output.artifacts[0].name, "lscpu.txt");
        assert_eq!(&output.artifacts[0].data[..], b"cpu info");
        assert!(ctx.processes.list().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_capture_reads_written_report() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let action = CommandAction::new(CommandStep::file(
            "sh",
            &["-c", "echo report > \"$0\"", "{out}"],
            "report.txt",
        ));
        let mut sink = OutputSink::new();

        action.execute(&mut sink, &ctx).await.unwrap();

        let output = sink.into_output();
        assert_eq!(&output.artifacts[0].data[..], b"report\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let action = CommandAction::stdout("sh", &["-c", "echo denied >&2; exit 3"], "out.txt");
        let mut sink = OutputSink::new();

        let err = action.execute(&mut sink, &ctx).await.unwrap_err();

        match err {
            TaskFailure::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "denied");
            }
            other => panic!("unexpected failure: {other}"),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let action = CommandAction::stdout("hostdiag-no-such-tool", &[], "out.txt");
        let mut sink = OutputSink::new();

        let err = action.execute(&mut sink, &ctx).await.unwrap_err();
        assert!(matches!(err, TaskFailure::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_the_future_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = action_context(dir.path());
        let action = CommandAction::stdout("sleep", &["30"], "never.txt");

        let registry = ctx.processes.clone();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut sink = OutputSink::new();
            action.execute(&mut sink, &run_ctx).await
        });

        // Wait for the process to be registered.
        let mut pid = None;
        for _ in 0..100 {
            if let Some(p) = registry.list().first() {
                pid = Some(p.pid);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let pid = pid.expect("sleep should have been registered");

        handle.abort();
        let _ = handle.await;
        assert!(registry.list().is_empty());

        // The process group is gone once the kill lands.
        let mut alive = true;
        for _ in 0..100 {
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if rc != 0 {
                alive = false;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!alive, "sleep (pid {pid}) survived cancellation");
    }
}
