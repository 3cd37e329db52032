//! Subprocess execution for driver "API calls".
//!
//! Every external tool invocation goes through [`CommandRunner`] and comes
//! back as a [`ToolOutput`]. Children are spawned with `kill_on_drop`, so
//! dropping the future of an aborted request also terminates the tool.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{Result, VmError};

/// Captured result of one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr, or stdout when the tool reported its failure there.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion, capturing output.
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> io::Result<ToolOutput>;

    /// Run `program` attached to the caller's terminal.
    async fn run_interactive(&self, program: &str, args: &[String]) -> io::Result<Option<i32>>;

    /// Cheap presence check. Must not execute anything.
    fn has_binary(&self, program: &str) -> bool;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> io::Result<ToolOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("{} did not finish within {:?}, killed", program, timeout);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{program} timed out after {}s", timeout.as_secs()),
                ));
            }
        };

        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("exit: {:?} ({} bytes stdout)", result.exit_code, result.stdout.len());
        Ok(result)
    }

    async fn run_interactive(&self, program: &str, args: &[String]) -> io::Result<Option<i32>> {
        debug!("exec (interactive): {} {}", program, args.join(" "));
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.code())
    }

    fn has_binary(&self, program: &str) -> bool {
        find_in_path(program).is_some()
    }
}

/// Locate `program` on `PATH` without running it.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| {
            let plain = dir.join(program);
            let exe = dir.join(format!("{program}.exe"));
            [plain, exe]
        })
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run a tool on behalf of `backend`, translating spawn failures into the
/// driver taxonomy. A missing binary is `Unavailable`; a timeout is `Timeout`.
pub async fn invoke(
    runner: &dyn CommandRunner,
    backend: &str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ToolOutput> {
    match runner.run(program, args, timeout).await {
        Ok(output) => Ok(output),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(VmError::unavailable(backend, format!("{program} is not installed")))
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(VmError::Timeout {
            what: format!("{program} {}", args.first().map(String::as_str).unwrap_or("")),
            after: timeout,
        }),
        Err(e) => Err(VmError::failed(backend, program, None, e.to_string())),
    }
}

/// Build an argv from string literals and owned values.
#[macro_export]
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$(::std::string::ToString::to_string(&$arg)),*]
    };
}

/// Liveness checks for daemonized hypervisor processes.
#[cfg(unix)]
pub mod pid {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::path::Path;

    /// Read a pid file written by the hypervisor. Garbage reads as `None`.
    pub fn read_pid_file(path: &Path) -> Option<i32> {
        let raw = std::fs::read_to_string(path).ok()?;
        raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
    }

    /// True when `pid` names a live, non-zombie process.
    pub fn is_alive(pid: i32) -> bool {
        exists(kill(Pid::from_raw(pid), None)) && !is_zombie(pid)
    }

    /// `EPERM` means the process exists but belongs to another user, e.g. a
    /// hypervisor started through sudo.
    fn exists(signalled: nix::Result<()>) -> bool {
        matches!(signalled, Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: i32) -> bool {
        // Field 3 of /proc/<pid>/stat, after the parenthesised comm.
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let rest = &stat[stat.rfind(')')? + 1..];
                rest.split_whitespace().next().map(|s| s == "Z")
            })
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: i32) -> bool {
        false
    }

    pub fn terminate(pid: i32) -> std::io::Result<()> {
        Ok(kill(Pid::from_raw(pid), Signal::SIGTERM)?)
    }

    pub fn force_kill(pid: i32) -> std::io::Result<()> {
        Ok(kill(Pid::from_raw(pid), Signal::SIGKILL)?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn foreign_process_counts_as_alive() {
            assert!(exists(Ok(())));
            assert!(exists(Err(Errno::EPERM)));
            assert!(!exists(Err(Errno::ESRCH)));
        }

        #[test]
        fn init_is_alive_for_any_user() {
            assert!(is_alive(1));
        }

        #[test]
        fn reaped_child_is_dead() {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let pid = child.id() as i32;
            child.wait().unwrap();
            assert!(!is_alive(pid));
        }
    }
}

#[cfg(not(unix))]
pub mod pid {
    use std::io;
    use std::path::Path;

    pub fn read_pid_file(path: &Path) -> Option<i32> {
        let raw = std::fs::read_to_string(path).ok()?;
        raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
    }

    pub fn is_alive(_pid: i32) -> bool {
        false
    }

    pub fn terminate(_pid: i32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "signals are unix-only"))
    }

    pub fn force_kill(pid: i32) -> io::Result<()> {
        terminate(pid)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner used by driver tests in place of real tools.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    type Handler = Box<dyn Fn(&[String]) -> ToolOutput + Send + Sync>;

    #[derive(Clone, Default)]
    pub struct ScriptedRunner {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        handlers: Mutex<Vec<(String, Handler)>>,
        binaries: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new(binaries: &[&str]) -> Self {
            let runner = Self::default();
            runner
                .inner
                .binaries
                .lock()
                .extend(binaries.iter().map(|b| b.to_string()));
            runner
        }

        /// Register a handler for `program`. Later handlers win.
        pub fn on<F>(&self, program: &str, handler: F)
        where
            F: Fn(&[String]) -> ToolOutput + Send + Sync + 'static,
        {
            self.inner
                .handlers
                .lock()
                .push((program.to_string(), Box::new(handler)));
        }

        pub fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> io::Result<ToolOutput> {
            self.inner
                .calls
                .lock()
                .push(format!("{} {}", program, args.join(" ")).trim().to_string());
            if !self.inner.binaries.lock().contains(program) {
                return Err(io::Error::new(io::ErrorKind::NotFound, program.to_string()));
            }
            let handlers = self.inner.handlers.lock();
            let handler = handlers.iter().rev().find(|(p, _)| p == program);
            Ok(match handler {
                Some((_, h)) => h(args),
                None => ToolOutput::ok(""),
            })
        }

        async fn run_interactive(&self, program: &str, args: &[String]) -> io::Result<Option<i32>> {
            self.run(program, args, Duration::from_secs(1))
                .await
                .map(|o| o.exit_code)
        }

        fn has_binary(&self, program: &str) -> bool {
            self.inner.binaries.lock().contains(program)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;
    use crate::vm::error::ErrorKind;

    #[tokio::test]
    async fn missing_binary_maps_to_unavailable() {
        let runner = ScriptedRunner::new(&[]);
        let err = invoke(&runner, "libvirt", "virsh", &argv!["list"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn system_runner_captures_exit_code_and_streams() {
        let runner = SystemRunner::new();
        let out = runner
            .run("sh", &argv!["-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.diagnostic(), "err");
    }

    #[tokio::test]
    async fn system_runner_kills_on_timeout() {
        let runner = SystemRunner::new();
        let err = runner
            .run("sleep", &argv!["30"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn garbage_pid_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(pid::read_pid_file(&path), None);
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(pid::read_pid_file(&path), Some(4242));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(pid::is_alive(std::process::id() as i32));
    }
}
