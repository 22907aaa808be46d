//! Persistent interactive shell for one endpoint.
//!
//! At most one shell is alive per [`TerminalSession`]. Output is batched on a
//! fixed tick and also retained in a bounded tail so a late joiner can catch
//! up. Every way a session can end (explicit stop, idle timeout, the shell
//! exiting on its own) is routed through one supervisor task that owns the
//! child process, so teardown runs once and emits exactly one
//! [`TerminalEvent::Ended`].

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::IdleClock;
use crate::runner::kill_process_tree;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const TAIL_CAPACITY: usize = 64 * 1024;

/// Largest output batch. Even if every byte needs a six-byte JSON escape the
/// batch stays under the relay frame cap.
pub const MAX_BATCH_BYTES: usize = 128 * 1024;

/// Read size for the shell's pipes.
const READ_CHUNK: usize = 8 * 1024;

/// Ends kept for a relay connection that has not picked them up yet.
const UNCLAIMED_END_CAPACITY: usize = 8;

/// Written verbatim instead of as a line.
pub const INTERRUPT: &str = "\x03";

/// Exit code reported when the shell was killed rather than exiting.
pub const KILLED_EXIT_CODE: i32 = -1;

/// How long teardown waits for the killed shell and its readers.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on how long [`TerminalSession::stop`] waits for `Idle`.
const STOP_WAIT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// One flushed batch of output lines.
    Output(String),
    /// The session ended. Sent exactly once per started session.
    Ended { exit_code: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("a terminal session is already running")]
    AlreadyRunning,
    #[error("failed to start shell: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Program and arguments used to launch the shell.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    /// Non-interactive shell without profile scripts.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self {
                program: "powershell".into(),
                args: ["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"]
                    .map(String::from)
                    .to_vec(),
            }
        } else {
            Self {
                program: "/bin/sh".into(),
                args: Vec::new(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub shell: ShellCommand,
    pub flush_interval: Duration,
    pub idle_timeout: Duration,
    pub tail_capacity: usize,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            shell: ShellCommand::platform_default(),
            flush_interval: FLUSH_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            tail_capacity: TAIL_CAPACITY,
        }
    }
}

/// Rolling window over the most recent output.
#[derive(Debug)]
struct OutputTail {
    buf: String,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity: capacity.max(4),
        }
    }

    /// Append, evicting at least the oldest quarter once over capacity.
    fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() <= self.capacity {
            return;
        }
        let mut cut = (self.capacity / 4).max(self.buf.len() - self.capacity);
        while !self.buf.is_char_boundary(cut) {
            cut += 1;
        }
        self.buf.drain(..cut);
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

struct Inner {
    state: SessionState,
    /// Incremented on every start; tasks of an earlier run compare against
    /// it and drop their writes.
    run: u64,
    pending: String,
    tail: OutputTail,
    /// Exit codes of ended runs not yet claimed by a relay connection.
    unclaimed_ends: VecDeque<i32>,
    input_tx: Option<mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<TerminalEvent>,
    idle: IdleClock,
    settings: TerminalSettings,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn push_output(&self, run: u64, text: &str) {
        let mut inner = self.inner.lock();
        if inner.run != run || inner.state == SessionState::Idle {
            return;
        }
        if !inner.pending.is_empty() && inner.pending.len() + text.len() > MAX_BATCH_BYTES {
            let batch = std::mem::take(&mut inner.pending);
            let _ = self.events.send(TerminalEvent::Output(batch));
        }
        inner.pending.push_str(text);
        inner.tail.push(text);
    }

    fn flush(&self, run: u64) {
        let mut inner = self.inner.lock();
        if inner.run != run || inner.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut inner.pending);
        let _ = self.events.send(TerminalEvent::Output(batch));
    }

    /// Move a live run to `Stopping` and wake its supervisor.
    fn request_stop(&self, run: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        if run.is_some_and(|r| r != inner.run) {
            return false;
        }
        match inner.state {
            SessionState::Starting | SessionState::Active => {
                self.set_state(&mut inner, SessionState::Stopping);
                if let Some(cancel) = &inner.cancel {
                    cancel.cancel();
                }
                true
            }
            SessionState::Idle | SessionState::Stopping => false,
        }
    }

    /// Final flush, release everything, return to `Idle`, announce the end.
    fn finish(&self, run: u64, exit_code: i32) {
        let mut inner = self.inner.lock();
        if inner.run != run || inner.state == SessionState::Idle {
            return;
        }
        if !inner.pending.is_empty() {
            let batch = std::mem::take(&mut inner.pending);
            let _ = self.events.send(TerminalEvent::Output(batch));
        }
        inner.input_tx = None;
        inner.cancel = None;
        if inner.unclaimed_ends.len() == UNCLAIMED_END_CAPACITY {
            inner.unclaimed_ends.pop_front();
        }
        inner.unclaimed_ends.push_back(exit_code);
        self.set_state(&mut inner, SessionState::Idle);
        let _ = self.events.send(TerminalEvent::Ended { exit_code });
        tracing::info!(exit_code, "terminal session ended");
    }
}

/// One endpoint's interactive shell. Cheap to clone.
#[derive(Clone)]
pub struct TerminalSession {
    shared: Arc<Shared>,
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSession {
    pub fn new() -> Self {
        Self::with_settings(TerminalSettings::default())
    }

    pub fn with_settings(settings: TerminalSettings) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            state: SessionState::Idle,
            run: 0,
            pending: String::new(),
            tail: OutputTail::new(settings.tail_capacity),
            unclaimed_ends: VecDeque::new(),
            input_tx: None,
            cancel: None,
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                state_tx,
                events,
                idle: IdleClock::new(),
                settings,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.shared.events.subscribe()
    }

    /// Recent output, bounded by the tail capacity.
    pub fn tail(&self) -> String {
        self.shared.inner.lock().tail.buf.clone()
    }

    /// Take the oldest session end nobody has reported yet.
    ///
    /// Every end is handed out exactly once, which lets a reporter that
    /// missed the broadcast (no relay connection at the time) catch up
    /// without a live reporter sending it a second time.
    pub(crate) fn claim_end(&self) -> Option<i32> {
        self.shared.inner.lock().unclaimed_ends.pop_front()
    }

    /// Return an end whose report could not be delivered.
    pub(crate) fn unclaim_end(&self, exit_code: i32) {
        let mut inner = self.shared.inner.lock();
        if inner.unclaimed_ends.len() < UNCLAIMED_END_CAPACITY {
            inner.unclaimed_ends.push_front(exit_code);
        }
    }

    /// Launch the shell. Fails without side effects if a session is live.
    pub fn start(&self) -> Result<(), TerminalError> {
        let shared = &self.shared;
        let (run, cancel) = {
            let mut inner = shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(TerminalError::AlreadyRunning);
            }
            shared.set_state(&mut inner, SessionState::Starting);
            inner.run += 1;
            inner.pending.clear();
            inner.tail.clear();
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            (inner.run, cancel)
        };

        let mut child = match spawn_shell(&shared.settings.shell) {
            Ok(child) => child,
            Err(e) => {
                let mut inner = shared.inner.lock();
                inner.cancel = None;
                shared.set_state(&mut inner, SessionState::Idle);
                tracing::warn!(error = %e, "failed to start terminal shell");
                return Err(e.into());
            }
        };
        tracing::info!(pid = ?child.id(), run, "terminal session started");

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let stdin = child.stdin.take();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(out, shared.clone(), run)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(err, shared.clone(), run)));
        }
        if let Some(stdin) = stdin {
            tokio::spawn(write_input(stdin, input_rx));
        }
        tokio::spawn(flush_ticker(shared.clone(), run, cancel.clone()));
        shared.idle.reset();
        tokio::spawn(idle_watcher(shared.clone(), run, cancel.clone()));

        {
            let mut inner = shared.inner.lock();
            inner.input_tx = Some(input_tx);
            // A stop issued while spawning already moved us to Stopping and
            // cancelled the token; the supervisor will tear down at once.
            if inner.state == SessionState::Starting {
                shared.set_state(&mut inner, SessionState::Active);
            }
        }

        let supervisor_shared = shared.clone();
        let handle = tokio::spawn(supervise(child, readers, supervisor_shared, run, cancel));
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!("terminal supervisor task failed: {e}");
            }
        });
        Ok(())
    }

    /// Queue input for the shell. Returns `false` unless the session is
    /// `Active`.
    pub fn send_input(&self, text: &str) -> bool {
        let inner = self.shared.inner.lock();
        if inner.state != SessionState::Active {
            return false;
        }
        let Some(tx) = &inner.input_tx else {
            return false;
        };
        let payload = if text == INTERRUPT || text.ends_with('\n') {
            text.to_string()
        } else {
            format!("{text}\n")
        };
        let sent = tx.send(payload).is_ok();
        if sent {
            self.shared.idle.touch();
        }
        sent
    }

    /// Ask the supervisor to tear the session down. Returns `true` if this
    /// call initiated the stop; repeated or concurrent calls are no-ops.
    pub fn request_stop(&self) -> bool {
        self.shared.request_stop(None)
    }

    /// Stop the session and wait until it is back to `Idle`.
    pub async fn stop(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        self.request_stop();
        let waited =
            tokio::time::timeout(STOP_WAIT, rx.wait_for(|s| *s == SessionState::Idle)).await;
        if waited.is_err() {
            tracing::warn!("terminal session did not reach idle after stop");
        }
    }
}

fn spawn_shell(shell: &ShellCommand) -> std::io::Result<Child> {
    let mut cmd = Command::new(&shell.program);
    cmd.args(&shell.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

/// Read a pipe in fixed-size chunks. A multi-byte character split across
/// reads is carried over to the next chunk instead of being mangled.
async fn pump_output(mut pipe: impl AsyncRead + Unpin, shared: Arc<Shared>, run: u64) {
    let mut chunk = [0u8; READ_CHUNK];
    let mut carry = Vec::with_capacity(READ_CHUNK + 4);
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                carry.extend_from_slice(&chunk[..n]);
                let text = take_utf8(&mut carry);
                if !text.is_empty() {
                    shared.push_output(run, &text);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "terminal pipe read failed");
                break;
            }
        }
    }
    if !carry.is_empty() {
        shared.push_output(run, &String::from_utf8_lossy(&carry));
    }
}

/// Decode as much of `buf` as possible, leaving an incomplete trailing
/// sequence (at most three bytes) in place. Invalid bytes are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(text) => {
            let text = text.to_string();
            buf.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&buf[..valid]).into_owned();
            buf.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            text
        }
    }
}

/// Sole writer to the shell's stdin, so input lands in submission order.
async fn write_input(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        let written = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::debug!(error = %e, "terminal stdin closed");
            break;
        }
    }
}

async fn flush_ticker(shared: Arc<Shared>, run: u64, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.settings.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.flush(run),
            _ = cancel.cancelled() => break,
        }
    }
}

async fn idle_watcher(shared: Arc<Shared>, run: u64, cancel: CancellationToken) {
    let idle = shared.idle.clone();
    tokio::select! {
        _ = idle.wait_for_idle(shared.settings.idle_timeout) => {
            if shared.request_stop(Some(run)) {
                tracing::info!(run, idle_secs = idle.idle_for().as_secs(), "terminal session idle, stopping");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    run: u64,
    cancel: CancellationToken,
) {
    let pid = child.id();
    let exited = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Some(status.code().unwrap_or(KILLED_EXIT_CODE)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait for terminal shell");
                None
            }
        },
        _ = cancel.cancelled() => None,
    };

    {
        let mut inner = shared.inner.lock();
        if inner.run == run && inner.state == SessionState::Active {
            shared.set_state(&mut inner, SessionState::Stopping);
        }
    }
    cancel.cancel();

    // A shell that exited on its own is already reaped and its pid may be
    // reused, so the group is only signalled while we still hold the child.
    if exited.is_none() {
        if let Some(pid) = pid {
            kill_process_tree(pid);
        }
        let _ = child.start_kill();
        if tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await.is_err() {
            tracing::error!(?pid, "terminal shell did not exit after kill");
        }
    }
    drop(child);

    for mut reader in readers {
        if tokio::time::timeout(TEARDOWN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    shared.finish(run, exited.unwrap_or(KILLED_EXIT_CODE));
}
