use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

use super::SandboxError;
use super::protocol::{HostMessage, WorkerMessage};

const DRIVER_PY: &str = include_str!("../../python/driver.py");

/// A supervised `python3` child speaking the JSON-lines protocol.
/// Owns the process handles; the [`Sandbox`](super::Sandbox) above it
/// owns the semantics (records, history, timeout policy).
pub struct PythonWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    hard_timeout: bool,
    // Keeps the driver script on disk for the lifetime of the worker.
    _driver: tempfile::TempPath,
}

impl PythonWorker {
    pub async fn spawn(
        python: &str,
        working_dir: Option<&PathBuf>,
    ) -> Result<Self, SandboxError> {
        let driver_file = tempfile::NamedTempFile::new()?;
        std::fs::write(driver_file.path(), DRIVER_PY)?;
        let driver = driver_file.into_temp_path();

        let mut cmd = tokio::process::Command::new(python);
        cmd.arg(&*driver)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit());
        if let Some(cwd) = working_dir {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("missing stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("missing stdout".to_string()))?;

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            hard_timeout: false,
            _driver: driver,
        };

        match worker.recv_timeout(Duration::from_secs(30)).await? {
            WorkerMessage::Ready { hard_timeout } => worker.hard_timeout = hard_timeout,
            other => {
                return Err(SandboxError::Protocol(format!(
                    "expected ready, got: {other:?}"
                )));
            }
        }

        Ok(worker)
    }

    /// Whether the worker enforces execution limits with SIGALRM.
    pub fn hard_timeout(&self) -> bool {
        self.hard_timeout
    }

    pub async fn send(&mut self, msg: HostMessage) -> Result<(), SandboxError> {
        self.check_alive()?;
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<WorkerMessage, SandboxError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(SandboxError::WorkerExited);
        }
        let msg: WorkerMessage = serde_json::from_str(line.trim())?;
        Ok(msg)
    }

    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<WorkerMessage, SandboxError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => {
                self.check_alive()?;
                Err(SandboxError::Unresponsive(timeout.as_secs()))
            }
        }
    }

    fn check_alive(&mut self) -> Result<(), SandboxError> {
        match self.child.try_wait() {
            Ok(Some(_status)) => Err(SandboxError::WorkerExited),
            Ok(None) => Ok(()),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl Drop for PythonWorker {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}
