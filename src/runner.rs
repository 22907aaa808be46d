use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::validator::{split_arguments, InstallerKind};

/// Lower bound for a one-shot execution timeout.
pub const MIN_TIMEOUT_SECS: u64 = 30;
/// Upper bound for a one-shot execution timeout.
pub const MAX_TIMEOUT_SECS: u64 = 600;
/// Per-stream capture ceiling.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// Appended to a stream that hit the capture ceiling.
pub const TRUNCATION_MARKER: &str = "...TRUNCATED";

/// How long to keep collecting output after the child is gone. A grandchild
/// holding the pipe open must not hang the caller.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a one-shot execution.
///
/// `rejection` is set only when validation refused the request, in which case
/// nothing was spawned. `error` is set when the process could not be started
/// or waited on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            rejection: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn start_failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            error: Some(error.into()),
            duration_ms: elapsed.as_millis() as u64,
            ..Default::default()
        }
    }
}

/// Inclusive bounds applied to every requested timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBounds {
    pub min: Duration,
    pub max: Duration,
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(MIN_TIMEOUT_SECS),
            max: Duration::from_secs(MAX_TIMEOUT_SECS),
        }
    }
}

impl TimeoutBounds {
    /// Clamp a requested timeout; `None` means the maximum.
    pub fn clamp(&self, requested_secs: Option<u64>) -> Duration {
        match requested_secs {
            Some(secs) => Duration::from_secs(secs).clamp(self.min, self.max),
            None => self.max,
        }
    }
}

/// Spawns one-shot processes with bounded time and bounded output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    bounds: TimeoutBounds,
    max_output: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            bounds: TimeoutBounds::default(),
            max_output: MAX_OUTPUT_BYTES,
        }
    }

    /// Runner with custom timeout bounds. Timeouts are still always clamped.
    pub fn with_bounds(bounds: TimeoutBounds) -> Self {
        Self {
            bounds,
            max_output: MAX_OUTPUT_BYTES,
        }
    }

    /// Run a staged installer unattended.
    pub async fn run_installer(
        &self,
        path: &Path,
        kind: InstallerKind,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> ExecutionResult {
        let (program, args) = installer_command(path, kind, arguments);
        self.run(&program, &args, timeout_secs).await
    }

    /// Run `program` with `args`, killing its process tree if it outlives the
    /// clamped timeout.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout_secs: Option<u64>,
    ) -> ExecutionResult {
        let timeout = self.bounds.clamp(timeout_secs);
        let started = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(program, error = %e, "failed to start process");
                return ExecutionResult::start_failed(
                    format!("failed to start {program}: {e}"),
                    started.elapsed(),
                );
            }
        };
        let pid = child.id();
        let mut guard = TreeGuard { pid };
        tracing::info!(program, ?pid, timeout_secs = timeout.as_secs(), "process started");

        let stdout = Arc::new(Capture::default());
        let stderr = Arc::new(Capture::default());
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, stdout.clone(), self.max_output)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain(pipe, stderr.clone(), self.max_output)));

        let (exit_code, timed_out, error) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Reaped: the pid may be recycled from here on.
                guard.disarm();
                (status.code(), false, None)
            }
            Ok(Err(e)) => (None, false, Some(format!("failed to wait for {program}: {e}"))),
            Err(_) => {
                tracing::warn!(program, ?pid, "process timed out, killing process tree");
                guard.fire();
                let _ = child.start_kill();
                if tokio::time::timeout(OUTPUT_GRACE, child.wait()).await.is_err() {
                    tracing::error!(program, ?pid, "process did not exit after kill");
                }
                (None, true, None)
            }
        };
        // Still armed only if waiting failed and the child's state is unknown.
        guard.fire();

        collect(stdout_task).await;
        collect(stderr_task).await;

        let result = ExecutionResult {
            success: !timed_out && error.is_none() && exit_code == Some(0),
            stdout: stdout.render(self.max_output),
            stderr: stderr.render(self.max_output),
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
            rejection: None,
            error,
        };
        tracing::info!(
            program,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "process finished"
        );
        result
    }
}

/// Build the command line for an installer.
///
/// Packages go through the platform package front-end with unattended flags
/// and any extra arguments appended. Executables get `/S` unless the caller
/// supplies a full replacement argument string.
pub fn installer_command(
    path: &Path,
    kind: InstallerKind,
    arguments: Option<&str>,
) -> (String, Vec<String>) {
    let path_str = path.to_string_lossy().into_owned();
    let extra = arguments.map(split_arguments).unwrap_or_default();
    match kind {
        InstallerKind::Package => {
            let mut args = vec![
                "/i".to_string(),
                path_str,
                "/qn".to_string(),
                "/norestart".to_string(),
            ];
            args.extend(extra);
            ("msiexec".to_string(), args)
        }
        InstallerKind::Executable => {
            let args = if extra.is_empty() {
                vec!["/S".to_string()]
            } else {
                extra
            };
            (path_str, args)
        }
    }
}

/// Cut `text` to at most `limit` bytes (on a char boundary) and append the
/// truncation marker. Text within the limit is returned unchanged.
pub fn truncate_output(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

/// Kills the process tree unless disarmed. Dropping an unfinished
/// [`ProcessRunner::run`] future (an aborted task, a runtime shutting down)
/// drops the guard before the child handle, so the whole group goes, not
/// just the direct child.
struct TreeGuard {
    pid: Option<u32>,
}

impl TreeGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }

    fn fire(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_tree(pid);
        }
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            tracing::warn!(pid, "execution abandoned, killing process tree");
        }
        self.fire();
    }
}

/// Kill a process and everything in its process group.
///
/// Children are spawned as process-group leaders, so signalling the negative
/// pid reaches descendants that did not create their own group.
#[cfg(unix)]
pub(crate) fn kill_process_tree(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(windows)]
pub(crate) fn kill_process_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::debug!(pid, error = %e, "taskkill failed");
    }
}

/// Output captured from one pipe, retained even if the reader task is
/// abandoned after the grace window.
#[derive(Default)]
struct Capture {
    buf: Mutex<Vec<u8>>,
    overflowed: AtomicBool,
}

impl Capture {
    fn render(&self, limit: usize) -> String {
        let text = String::from_utf8_lossy(&self.buf.lock()).into_owned();
        if self.overflowed.load(Ordering::Acquire) && text.len() <= limit {
            // Lossy decoding can only shrink below the limit when the cut
            // landed inside a multi-byte sequence; still mark it.
            let mut text = text;
            text.push_str(TRUNCATION_MARKER);
            return text;
        }
        truncate_output(text, limit)
    }
}

/// Read a pipe to EOF, keeping at most `limit + 1` bytes so overflow is
/// detectable without unbounded growth.
async fn drain(mut pipe: impl AsyncRead + Unpin, capture: Arc<Capture>, limit: usize) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut buf = capture.buf.lock();
                let room = (limit + 1).saturating_sub(buf.len());
                if room < n {
                    capture.overflowed.store(true, Ordering::Release);
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
}

async fn collect(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else { return };
    match tokio::time::timeout(OUTPUT_GRACE, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("output reader task failed: {e}"),
        Err(_) => {
            tracing::warn!("output pipe still open after grace window, abandoning reader");
            task.abort();
        }
    }
}
