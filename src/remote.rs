//! Stopping a server running in another process.
//!
//! The only control channel is the OS interrupt signal. The PID file tells us
//! whom to signal, and its disappearance tells us the target finished its
//! stop sequence: a server releases its PID file only after draining and
//! running every shutdown callback.
//!
//! Only graceful termination is detected reliably. A target killed with
//! SIGKILL leaves its PID file behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{REMOTE_STOP_POLL_ATTEMPTS, REMOTE_STOP_POLL_INTERVAL_MS};
use crate::pidfile::{self, PidFileError};

#[derive(Debug, thiserror::Error)]
pub enum RemoteStopError {
    #[error("Server is not running ({})", describe_not_running(path, *pid))]
    NotRunning { path: PathBuf, pid: Option<u32> },

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("Process {pid} is running but could not be signalled: {source}")]
    Unresponsive {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("Process {pid} did not stop within {waited:?}")]
    Timeout { pid: u32, waited: Duration },
}

fn describe_not_running(path: &Path, pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("process {} from {} no longer exists", pid, path.display()),
        None => format!("no PID file at {}", path.display()),
    }
}

/// Remote stop with a fixed polling schedule.
#[derive(Debug, Clone, Copy)]
pub struct RemoteStop {
    pub poll_interval: Duration,
    pub attempts: u32,
}

impl Default for RemoteStop {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(REMOTE_STOP_POLL_INTERVAL_MS),
            attempts: REMOTE_STOP_POLL_ATTEMPTS,
        }
    }
}

impl RemoteStop {
    /// Total time waited before giving up.
    pub fn timeout(&self) -> Duration {
        self.poll_interval * self.attempts
    }

    /// Interrupt the process named by the PID file at `path` and wait for it
    /// to stop. Returns the PID that was stopped.
    pub async fn stop(&self, path: &Path) -> Result<u32, RemoteStopError> {
        let pid = pidfile::read_pid(path)?.ok_or_else(|| RemoteStopError::NotRunning {
            path: path.to_path_buf(),
            pid: None,
        })?;
        let target = target_pid(path, pid)?;

        match kill(target, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                return Err(RemoteStopError::NotRunning {
                    path: path.to_path_buf(),
                    pid: Some(pid),
                })
            }
            Err(source) => return Err(RemoteStopError::Unresponsive { pid, source }),
        }

        tracing::info!(pid, pid_file = %path.display(), "Sending SIGINT to server");
        kill(target, Signal::SIGINT).map_err(|source| match source {
            Errno::ESRCH => RemoteStopError::NotRunning {
                path: path.to_path_buf(),
                pid: Some(pid),
            },
            source => RemoteStopError::Unresponsive { pid, source },
        })?;

        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.poll_interval).await;

            if !path.exists() {
                tracing::info!(pid, attempts = attempt, "Server stopped");
                return Ok(pid);
            }
            if let Err(Errno::ESRCH) = kill(target, None) {
                tracing::warn!(
                    pid,
                    pid_file = %path.display(),
                    "Server exited without removing its PID file"
                );
                return Ok(pid);
            }
        }

        Err(RemoteStopError::Timeout {
            pid,
            waited: self.timeout(),
        })
    }
}

/// Stop the server whose PID file is at `path` with the default schedule.
pub async fn stop_remote(path: &Path) -> Result<u32, RemoteStopError> {
    RemoteStop::default().stop(path).await
}

/// Send SIGKILL to `pid`. The target gets no chance to drain or clean up.
pub fn force_kill(pid: u32) -> Result<(), RemoteStopError> {
    let target = i32::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
        .ok_or(RemoteStopError::Unresponsive {
            pid,
            source: Errno::EINVAL,
        })?;

    tracing::warn!(pid, "Sending SIGKILL");
    kill(target, Signal::SIGKILL).map_err(|source| RemoteStopError::Unresponsive { pid, source })
}

/// 0 and values past `i32::MAX` would address process groups, not one process.
fn target_pid(path: &Path, pid: u32) -> Result<Pid, RemoteStopError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(PidFileError::Corrupt {
            path: path.to_path_buf(),
            contents: pid.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast() -> RemoteStop {
        RemoteStop {
            poll_interval: Duration::from_millis(10),
            attempts: 5,
        }
    }

    #[tokio::test]
    async fn test_missing_pid_file_is_not_running() {
        let dir = TempDir::new().unwrap();
        let err = fast().stop(&dir.path().join("none.pid")).await.unwrap_err();
        assert!(matches!(err, RemoteStopError::NotRunning { pid: None, .. }));
    }

    #[tokio::test]
    async fn test_garbage_pid_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        let err = fast().stop(&path).await.unwrap_err();
        assert!(matches!(err, RemoteStopError::PidFile(PidFileError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_pid_zero_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.pid");
        std::fs::write(&path, "0").unwrap();

        let err = fast().stop(&path).await.unwrap_err();
        assert!(matches!(err, RemoteStopError::PidFile(PidFileError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_dead_process_is_not_running() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dead.pid");

        // Reap a short-lived child so its PID no longer exists
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(&path, pid.to_string()).unwrap();

        let err = fast().stop(&path).await.unwrap_err();
        assert!(matches!(err, RemoteStopError::NotRunning { pid: Some(p), .. } if p == pid));
    }

    #[tokio::test]
    async fn test_process_ignoring_sigint_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stubborn.pid");

        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' INT; sleep 5"])
            .spawn()
            .unwrap();
        std::fs::write(&path, child.id().to_string()).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = fast().stop(&path).await.unwrap_err();
        assert!(matches!(err, RemoteStopError::Timeout { .. }));
        assert!(path.exists());

        force_kill(child.id()).unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_default_schedule() {
        let remote = RemoteStop::default();
        assert_eq!(remote.timeout(), Duration::from_secs(5));
    }
}
