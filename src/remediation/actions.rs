use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use futures::FutureExt;

use super::{ActionOutput, RemediationAction};
use crate::runner::{ExecutionResult, ProcessRunner};

/// Timeout requested for the short system commands below.
const COMMAND_TIMEOUT_SECS: u64 = 60;

fn require_success(what: &str, result: ExecutionResult) -> anyhow::Result<ActionOutput> {
    if result.success {
        return Ok(ActionOutput::new(format!("{what} succeeded"), result.stdout));
    }
    if let Some(err) = result.error {
        bail!("{what} failed: {err}");
    }
    if result.timed_out {
        bail!("{what} timed out");
    }
    let detail = if result.stderr.trim().is_empty() {
        result.stdout
    } else {
        result.stderr
    };
    bail!(
        "{what} failed (exit code {}): {}",
        result.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
        detail.trim()
    )
}

pub struct FlushDns {
    runner: ProcessRunner,
}

impl FlushDns {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    fn command() -> (&'static str, Vec<String>) {
        if cfg!(windows) {
            ("ipconfig", vec!["/flushdns".into()])
        } else if cfg!(target_os = "macos") {
            ("dscacheutil", vec!["-flushcache".into()])
        } else {
            ("resolvectl", vec!["flush-caches".into()])
        }
    }
}

impl RemediationAction for FlushDns {
    fn id(&self) -> &'static str {
        "flush_dns"
    }

    fn requires_elevation(&self) -> bool {
        false
    }

    fn parameter(&self) -> Option<&'static str> {
        None
    }

    fn run<'a>(&'a self, _parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
        async move {
            let (program, args) = Self::command();
            let result = self.runner.run(program, &args, Some(COMMAND_TIMEOUT_SECS)).await;
            require_success("DNS cache flush", result)
        }
        .boxed()
    }
}

/// Deletes entries in a temporary directory that have not been modified for
/// `min_age`. Entries that cannot be removed (in use, permission denied) are
/// counted and skipped.
pub struct ClearTempFiles {
    dir: PathBuf,
    min_age: Duration,
}

impl ClearTempFiles {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            min_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Sweep {
    removed: usize,
    skipped: usize,
    bytes: u64,
}

fn entry_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|rd| rd.flatten().map(|e| entry_size(&e.path())).sum())
        .unwrap_or(0)
}

fn sweep(dir: &Path, min_age: Duration, now: SystemTime) -> std::io::Result<Sweep> {
    let mut stats = Sweep::default();
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            stats.skipped += 1;
            continue;
        };
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            stats.skipped += 1;
            continue;
        };
        let old_enough = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age >= min_age);
        if !old_enough {
            continue;
        }
        let size = entry_size(&path);
        let removed = if meta.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                stats.removed += 1;
                stats.bytes += size;
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping temp entry");
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

impl RemediationAction for ClearTempFiles {
    fn id(&self) -> &'static str {
        "clear_temp_files"
    }

    fn requires_elevation(&self) -> bool {
        false
    }

    fn parameter(&self) -> Option<&'static str> {
        None
    }

    fn run<'a>(&'a self, _parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
        async move {
            let dir = self.dir.clone();
            let min_age = self.min_age;
            let stats = tokio::task::spawn_blocking(move || sweep(&dir, min_age, SystemTime::now()))
                .await
                .context("temp sweep task failed")?
                .with_context(|| format!("cannot read {}", self.dir.display()))?;
            Ok(ActionOutput::new(
                format!(
                    "removed {} entries ({} bytes), skipped {}",
                    stats.removed, stats.bytes, stats.skipped
                ),
                String::new(),
            ))
        }
        .boxed()
    }
}

/// Services an operator may restart.
#[cfg(windows)]
const RESTARTABLE_SERVICES: &[&str] = &["Spooler", "wuauserv", "BITS", "Dnscache", "W32Time", "Audiosrv"];
#[cfg(not(windows))]
const RESTARTABLE_SERVICES: &[&str] = &["cups", "systemd-resolved", "NetworkManager", "bluetooth", "avahi-daemon"];

/// Canonical spelling of an allow-listed service name, matched
/// case-insensitively.
pub fn allowed_service(name: &str) -> Option<&'static str> {
    RESTARTABLE_SERVICES
        .iter()
        .copied()
        .find(|s| s.eq_ignore_ascii_case(name))
}

pub struct RestartService {
    runner: ProcessRunner,
}

impl RestartService {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

impl RemediationAction for RestartService {
    fn id(&self) -> &'static str {
        "restart_service"
    }

    fn requires_elevation(&self) -> bool {
        true
    }

    fn parameter(&self) -> Option<&'static str> {
        Some("service")
    }

    fn run<'a>(&'a self, parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
        async move {
            let requested = parameter.unwrap_or_default();
            let Some(service) = allowed_service(requested) else {
                bail!("service {requested:?} is not on the restart allow-list");
            };
            let (program, args): (&str, Vec<String>) = if cfg!(windows) {
                (
                    "powershell",
                    vec![
                        "-NoProfile".into(),
                        "-NonInteractive".into(),
                        "-Command".into(),
                        format!("Restart-Service -Name '{service}' -Force"),
                    ],
                )
            } else {
                ("systemctl", vec!["restart".into(), service.into()])
            };
            let result = self.runner.run(program, &args, Some(COMMAND_TIMEOUT_SECS)).await;
            require_success(&format!("restart of {service}"), result)
        }
        .boxed()
    }
}

/// Process names that must never be terminated, lowercase.
const PROTECTED_PROCESSES: &[&str] = &[
    "system",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "winlogon.exe",
    "services.exe",
    "lsass.exe",
    "svchost.exe",
    "init",
    "systemd",
    "launchd",
    "kernel_task",
    "sshd",
    "deskrelay",
    "deskrelay.exe",
];

pub fn is_protected(name: &str) -> bool {
    let name = name.trim().to_ascii_lowercase();
    PROTECTED_PROCESSES.contains(&name.as_str())
}

/// Parse and sanity-check a pid supplied by an operator.
pub fn parse_pid(raw: &str, own_pid: u32) -> anyhow::Result<u32> {
    let pid: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid process id {raw:?}"))?;
    if pid <= 1 {
        bail!("process id {pid} is reserved");
    }
    if pid == own_pid {
        bail!("refusing to terminate the agent itself");
    }
    Ok(pid)
}

#[cfg(target_os = "linux")]
fn process_name(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(windows)]
fn process_name(pid: u32) -> Option<String> {
    let out = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&out.stdout);
    let first = text.lines().next()?;
    let name = first.split(',').next()?.trim_matches('"');
    (!name.is_empty() && !name.starts_with("INFO:")).then(|| name.to_string())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn process_name(pid: u32) -> Option<String> {
    let out = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let base = name.rsplit('/').next().unwrap_or_default().to_string();
    (!base.is_empty()).then_some(base)
}

#[cfg(unix)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    if pid > i32::MAX as u32 {
        bail!("process id {pid} out of range");
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to terminate process {pid}"));
    }
    Ok(())
}

#[cfg(windows)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()
        .context("failed to run taskkill")?;
    if !status.success() {
        bail!("taskkill failed for process {pid}");
    }
    Ok(())
}

fn checked_name(pid: u32) -> anyhow::Result<String> {
    let name = process_name(pid).with_context(|| format!("no process with id {pid}"))?;
    if is_protected(&name) {
        bail!("process {name} ({pid}) is protected");
    }
    Ok(name)
}

/// Check the target is not protected and kill it, returning its name.
///
/// The check and the signal must hit the same process. On Linux the process
/// is pinned with a pidfd first; a pid recycled after that point cannot
/// receive the signal.
#[cfg(target_os = "linux")]
fn kill_unprotected(pid: u32) -> anyhow::Result<String> {
    let fd = match pidfd::open(pid) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => bail!("no process with id {pid}"),
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => return kill_rechecked(pid),
        Err(e) => return Err(e).with_context(|| format!("failed to open process {pid}")),
    };
    let name = checked_name(pid)?;
    pidfd::kill(&fd).with_context(|| format!("failed to terminate process {pid}"))?;
    Ok(name)
}

#[cfg(not(target_os = "linux"))]
fn kill_unprotected(pid: u32) -> anyhow::Result<String> {
    kill_rechecked(pid)
}

/// Without a pidfd: read the name again right before the signal, so a pid
/// recycled since the check shows up as a different process.
fn kill_rechecked(pid: u32) -> anyhow::Result<String> {
    let name = checked_name(pid)?;
    if process_name(pid).as_deref() != Some(name.as_str()) {
        bail!("process {pid} changed while it was being checked");
    }
    terminate(pid)?;
    Ok(name)
}

#[cfg(target_os = "linux")]
mod pidfd {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    pub(super) fn open(pid: u32) -> std::io::Result<OwnedFd> {
        if pid > i32::MAX as u32 {
            return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
        }
        // SAFETY: pidfd_open(2) takes plain integers and touches no memory.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: a non-negative return is a fresh descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
    }

    pub(super) fn kill(fd: &OwnedFd) -> std::io::Result<()> {
        // SAFETY: the descriptor is live for the call and a null siginfo is
        // allowed.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                fd.as_raw_fd(),
                libc::SIGKILL,
                std::ptr::null::<libc::siginfo_t>(),
                0 as libc::c_uint,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

pub struct KillProcess;

impl RemediationAction for KillProcess {
    fn id(&self) -> &'static str {
        "kill_process"
    }

    fn requires_elevation(&self) -> bool {
        true
    }

    fn parameter(&self) -> Option<&'static str> {
        Some("pid")
    }

    fn run<'a>(&'a self, parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
        async move {
            let pid = parse_pid(parameter.unwrap_or_default(), std::process::id())?;
            let name = tokio::task::spawn_blocking(move || kill_unprotected(pid))
                .await
                .context("process kill task failed")??;
            tracing::info!(pid, name, "terminated process");
            Ok(ActionOutput::new(format!("terminated {name} ({pid})"), String::new()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_validation() {
        assert!(parse_pid("abc", 10).is_err());
        assert!(parse_pid("-5", 10).is_err());
        assert!(parse_pid("0", 10).is_err());
        assert!(parse_pid("1", 10).is_err());
        assert!(parse_pid("10", 10).is_err());
        assert_eq!(parse_pid(" 4242 ", 10).unwrap(), 4242);
    }

    #[test]
    fn protected_names_match_case_insensitively() {
        assert!(is_protected("LSASS.EXE"));
        assert!(is_protected("systemd"));
        assert!(!is_protected("notepad.exe"));
    }

    #[test]
    fn service_allow_list() {
        let first = RESTARTABLE_SERVICES[0];
        assert_eq!(allowed_service(&first.to_uppercase()), Some(first));
        assert_eq!(allowed_service("sshd; rm -rf /"), None);
        assert_eq!(allowed_service(""), None);
    }

    #[test]
    fn sweep_removes_only_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.tmp"), b"123").unwrap();

        // Nothing is a day old yet.
        let stats = sweep(dir.path(), Duration::from_secs(3600), SystemTime::now()).unwrap();
        assert_eq!(stats, Sweep::default());

        // Viewed from two hours in the future, everything qualifies.
        let later = SystemTime::now() + Duration::from_secs(7200);
        let stats = sweep(dir.path(), Duration::from_secs(3600), later).unwrap();
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.bytes, 8);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unlisted_service_is_refused() {
        let action = RestartService::new(ProcessRunner::new());
        let err = action.run(Some("definitely-not-allowed")).await.unwrap_err();
        assert!(err.to_string().contains("allow-list"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_process_terminates_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().to_string();
        KillProcess.run(Some(&pid)).await.unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn reaped_process_is_not_signalled() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let err = kill_unprotected(pid).unwrap_err();
        assert!(err.to_string().contains("no process"), "{err:#}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kill_reports_the_pinned_process_name() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert_eq!(kill_unprotected(child.id()).unwrap(), "sleep");
        assert!(!child.wait().unwrap().success());
    }

    #[tokio::test]
    async fn kill_process_refuses_self() {
        let own = std::process::id().to_string();
        assert!(KillProcess.run(Some(&own)).await.is_err());
    }
}
