//! External process supervision: spawn, graceful stop, forced kill.
//!
//! Modem and CAT control executables are started with their own directory
//! as working directory and the daemon's environment. Their stdout/stderr
//! are forwarded line by line into the daemon log.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Stop never fails: every wait is bounded and falls back to a kill

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time a process gets to exit after SIGTERM.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for reaping a process after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors starting an external process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Executable not found on the search path
    #[error("Failed to find executable {cmd:?}: {reason}")]
    ExecutableNotFound { cmd: String, reason: String },

    /// The OS refused to start the process
    #[error("Failed to start {}: {reason}", path.display())]
    SpawnFailed { path: PathBuf, reason: String },
}

/// How a [`ManagedProcess`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own or after SIGTERM
    Exited(ExitStatus),
    /// Had to be force-killed
    Killed,
    /// Could not be confirmed dead; the handle was released anyway
    Abandoned,
}

/// A running child process owned by a session.
///
/// The child is also marked kill-on-drop, so a handle lost on a panic path
/// still takes its process down with it.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    path: PathBuf,
    child: Child,
}

impl ManagedProcess {
    /// Resolved executable path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns the exit status if the process already exited.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Stops the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Consumes the handle; the OS resources are released whatever happens.
    /// Errors are logged, never returned.
    pub async fn graceful_stop(mut self, grace: Duration) -> StopOutcome {
        if let Some(status) = self.try_exited() {
            info!(process = %self.label, %status, "Process had already exited");
            return StopOutcome::Exited(status);
        }

        if self.terminate() {
            debug!(process = %self.label, "Sent SIGTERM");
            match timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(process = %self.label, %status, "Process stopped");
                    return StopOutcome::Exited(status);
                }
                Ok(Err(e)) => {
                    warn!(process = %self.label, error = %e, "Waiting for process failed, killing");
                }
                Err(_) => {
                    warn!(
                        process = %self.label,
                        grace_secs = grace.as_secs_f64(),
                        "Process ignored SIGTERM, killing"
                    );
                }
            }
        } else {
            debug!(process = %self.label, "Graceful signal unavailable, killing");
        }

        match timeout(KILL_TIMEOUT, self.child.kill()).await {
            Ok(Ok(())) => {
                info!(process = %self.label, "Process killed");
                StopOutcome::Killed
            }
            Ok(Err(e)) => {
                warn!(process = %self.label, error = %e, "Failed to kill process");
                StopOutcome::Abandoned
            }
            Err(_) => {
                warn!(process = %self.label, "Process did not die after SIGKILL");
                StopOutcome::Abandoned
            }
        }
    }

    /// Sends SIGTERM. Returns false if the signal could not be delivered.
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        let Some(pid) = self.child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return false;
        };

        // SAFETY: kill(2) has no memory-safety preconditions; `pid` is our
        // own child, which cannot have been reaped while we hold `Child`.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            warn!(
                process = %self.label,
                error = %std::io::Error::last_os_error(),
                "Failed to send SIGTERM"
            );
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }
}

/// Starts `cmd` with `args`.
///
/// The executable is resolved on the search path, runs in its own directory
/// with the inherited environment, and has its output piped into the log.
pub fn spawn<I, S>(label: &str, cmd: &str, args: I) -> Result<ManagedProcess, SpawnError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let path = which::which(cmd).map_err(|e| SpawnError::ExecutableNotFound {
        cmd: cmd.to_string(),
        reason: e.to_string(),
    })?;

    let mut command = Command::new(&path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = path.parent() {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| SpawnError::SpawnFailed {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    info!(
        process = %label,
        path = %path.display(),
        pid = ?child.id(),
        "Process started"
    );

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(label.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(label.to_string(), "stderr", stderr));
    }

    Ok(ManagedProcess {
        label: label.to_string(),
        path,
        child,
    })
}

/// Arguments for a modem executable: the whole string as one argument.
///
/// Wine-hosted modems take a Windows path that may contain spaces.
pub fn modem_args(args: &str) -> Vec<String> {
    let args = args.trim();
    if args.is_empty() {
        Vec::new()
    } else {
        vec![args.to_string()]
    }
}

/// Arguments for a CAT control executable: whitespace separated.
pub fn cat_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_string).collect()
}

/// Copies a child's output stream into the log until EOF.
///
/// Reads raw bytes so a child printing non-UTF-8 output keeps being drained.
async fn forward_output<R>(label: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                info!(target: "rigkeeperd::child", process = %label, stream, "{}", line.trim_end());
            }
            Err(e) => {
                debug!(process = %label, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modem_args_single_argument() {
        assert!(modem_args("").is_empty());
        assert!(modem_args("   ").is_empty());
        assert_eq!(
            modem_args(r"C:\VARA HF\VARA.exe"),
            vec![r"C:\VARA HF\VARA.exe".to_string()]
        );
    }

    #[test]
    fn test_cat_args_split() {
        assert_eq!(cat_args("-m 3073  -t 4532"), ["-m", "3073", "-t", "4532"]);
        assert!(cat_args("").is_empty());
    }

    #[test]
    fn test_spawn_error_display() {
        let err = SpawnError::ExecutableNotFound {
            cmd: "VARA.exe".to_string(),
            reason: "cannot find binary path".to_string(),
        };
        assert!(err.to_string().contains("VARA.exe"));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let err = spawn("test", "this-command-does-not-exist", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SpawnError::ExecutableNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_stop_terminates() {
        let process = spawn("sleeper", "sleep", ["30"]).unwrap();
        assert!(process.pid().is_some());

        let outcome = process.graceful_stop(Duration::from_secs(5)).await;
        match outcome {
            StopOutcome::Exited(status) => assert!(!status.success()),
            other => panic!("Expected Exited, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_stop_kills_stubborn_process() {
        let process = spawn("stubborn", "sh", ["-c", "trap '' TERM; exec sleep 30"]).unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let outcome = process.graceful_stop(Duration::from_millis(300)).await;
        assert_eq!(outcome, StopOutcome::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_stop_after_exit() {
        let mut process = spawn("quick", "sh", ["-c", "exit 0"]).unwrap();
        for _ in 0..50 {
            if process.try_exited().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let outcome = process.graceful_stop(Duration::from_secs(1)).await;
        assert!(matches!(outcome, StopOutcome::Exited(status) if status.success()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_runs_in_executable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("cwd.txt");
        let script = format!("pwd > '{}'", marker.display());

        let mut process = spawn("pwd", "sh", ["-c", script.as_str()]).unwrap();
        let sh_dir = process.path().parent().unwrap().canonicalize().unwrap();
        for _ in 0..100 {
            if process.try_exited().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let cwd = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(std::path::Path::new(cwd.trim()).canonicalize().unwrap(), sh_dir);
    }
}
