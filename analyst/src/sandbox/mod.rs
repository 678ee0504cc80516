//! Persistent Python execution sandbox.
//!
//! One [`Sandbox`] wraps one long-lived interpreter worker process.
//! State set by one execution is visible to the next until `reset()`.
//! Every `execute` call produces exactly one [`ExecutionRecord`] in the
//! append-only history, whatever the outcome; user code can fail, time
//! out, or even kill the interpreter without taking the host down.

pub mod protocol;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use protocol::{HostMessage, WorkerMessage};
use worker::PythonWorker;

/// Feedback to the engine is capped at this many characters.
pub const MAX_OUTPUT_CHARS: usize = 1000;

/// Extra host-side wait beyond the worker-enforced limit before the
/// worker is declared stuck.
const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("spawn error: {0}")]
    Spawn(String),
    #[error("interpreter process exited unexpectedly")]
    WorkerExited,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker did not respond within {0}s")]
    Unresponsive(u64),
}

/// How execution time limits are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCapability {
    /// The worker interrupts running code with SIGALRM.
    Hard,
    /// No in-worker interruption; code runs to completion and the limit
    /// is advisory only.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotImage {
    pub mime: String,
    pub data: Vec<u8>,
}

impl PlotImage {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            mime: "image/png".to_string(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// The immutable result of one code execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub code: String,
    pub output: String,
    pub error: Option<String>,
    pub images: Vec<PlotImage>,
    pub succeeded: bool,
    pub duration_ms: u64,
}

/// Cheap cloneable read handle over a sandbox's record list. Readers
/// only ever get owned snapshots, never a live view.
#[derive(Clone, Default)]
pub struct ExecutionHistory {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl ExecutionHistory {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn push(&self, record: ExecutionRecord) {
        self.lock().push(record);
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

pub struct Sandbox {
    worker: Option<PythonWorker>,
    python: String,
    working_dir: Option<PathBuf>,
    capability: TimeoutCapability,
    history: ExecutionHistory,
}

impl Sandbox {
    pub async fn new(python: &str, working_dir: Option<PathBuf>) -> Result<Self, SandboxError> {
        let worker = PythonWorker::spawn(python, working_dir.as_ref()).await?;
        let capability = if worker.hard_timeout() {
            TimeoutCapability::Hard
        } else {
            TimeoutCapability::BestEffort
        };
        if capability == TimeoutCapability::BestEffort {
            tracing::warn!(python, "worker cannot interrupt code; timeouts are best-effort");
        } else {
            tracing::debug!(python, "sandbox worker ready with hard timeouts");
        }
        Ok(Self {
            worker: Some(worker),
            python: python.to_string(),
            working_dir,
            capability,
            history: ExecutionHistory::default(),
        })
    }

    pub fn timeout_capability(&self) -> TimeoutCapability {
        self.capability
    }

    /// Cloneable handle for observing the history without holding the
    /// sandbox itself.
    pub fn history(&self) -> ExecutionHistory {
        self.history.clone()
    }

    pub fn snapshot_history(&self) -> Vec<ExecutionRecord> {
        self.history.snapshot()
    }

    /// Run `code` in the persistent namespace. Always yields a record:
    /// failures of any kind — exceptions, timeouts, an interpreter the
    /// code managed to kill, even a corrupted protocol stream — land in
    /// the record, keeping history length equal to the call count. An
    /// unusable worker is torn down and revived by the next `reset()`.
    pub async fn execute(
        &mut self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionRecord, SandboxError> {
        let start = Instant::now();
        let result = match self.worker.as_mut() {
            Some(worker) => exec_on_worker(worker, self.capability, code, timeout).await,
            None => {
                let record = dead_worker_record(code, start);
                self.history.push(record.clone());
                return Ok(record);
            }
        };
        match result {
            Ok((output, error, plots, success)) => {
                let record = ExecutionRecord {
                    code: code.to_string(),
                    output,
                    error: error.filter(|e| !e.is_empty()),
                    images: decode_plots(&plots),
                    succeeded: success,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                self.history.push(record.clone());
                Ok(record)
            }
            // A parse or protocol fault means the stream can no longer
            // be trusted, so it gets the same treatment as a dead pipe.
            Err(e) => self.degrade(code, start, e),
        }
    }

    /// Merge values into the interpreter namespace without clearing it.
    pub async fn inject(
        &mut self,
        vars: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SandboxError> {
        let worker = self.worker.as_mut().ok_or(SandboxError::WorkerExited)?;
        let id = uuid::Uuid::new_v4().to_string();
        worker
            .send(HostMessage::Inject {
                id: id.clone(),
                vars,
            })
            .await?;
        loop {
            match worker.recv_timeout(Duration::from_secs(30)).await? {
                WorkerMessage::InjectResult { id: reply_id } if reply_id == id => return Ok(()),
                _ => continue,
            }
        }
    }

    /// Clear the namespace and the execution history. A worker that is
    /// gone or unusable — whether it died mid-execution or quietly
    /// while idle — is replaced with a fresh one.
    pub async fn reset(&mut self) -> Result<(), SandboxError> {
        if let Some(worker) = self.worker.as_mut() {
            match reset_on_worker(worker).await {
                Ok(()) => {
                    self.history.clear();
                    return Ok(());
                }
                Err(cause) => {
                    tracing::warn!(%cause, "worker unusable during reset; respawning");
                    if let Some(mut worker) = self.worker.take() {
                        worker.kill();
                    }
                }
            }
        } else {
            tracing::info!("respawning dead sandbox worker");
        }
        let worker = PythonWorker::spawn(&self.python, self.working_dir.as_ref()).await?;
        self.capability = if worker.hard_timeout() {
            TimeoutCapability::Hard
        } else {
            TimeoutCapability::BestEffort
        };
        self.worker = Some(worker);
        self.history.clear();
        Ok(())
    }

    fn degrade(
        &mut self,
        code: &str,
        start: Instant,
        cause: SandboxError,
    ) -> Result<ExecutionRecord, SandboxError> {
        tracing::warn!(%cause, "sandbox worker lost during execution");
        if let Some(mut worker) = self.worker.take() {
            worker.kill();
        }
        let record = ExecutionRecord {
            code: code.to_string(),
            output: String::new(),
            error: Some(format!("{cause}")),
            images: Vec::new(),
            succeeded: false,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.history.push(record.clone());
        Ok(record)
    }
}

/// Drive one exec round-trip on the wire. With hard timeouts the host
/// waits a grace period past the worker's own limit; in best-effort
/// mode the code is allowed to run to completion.
async fn exec_on_worker(
    worker: &mut PythonWorker,
    capability: TimeoutCapability,
    code: &str,
    timeout: Duration,
) -> Result<(String, Option<String>, Vec<String>, bool), SandboxError> {
    let id = uuid::Uuid::new_v4().to_string();
    worker
        .send(HostMessage::Exec {
            id: id.clone(),
            code: code.to_string(),
            timeout_secs: timeout.as_secs().max(1),
        })
        .await?;

    loop {
        let msg = if capability == TimeoutCapability::Hard {
            worker.recv_timeout(timeout + TIMEOUT_GRACE).await?
        } else {
            worker.recv().await?
        };
        match msg {
            WorkerMessage::ExecResult {
                id: reply_id,
                output,
                error,
                plots,
                success,
            } if reply_id == id => return Ok((output, error, plots, success)),
            WorkerMessage::ExecResult { .. } | WorkerMessage::Ready { .. } => continue,
            other => {
                return Err(SandboxError::Protocol(format!(
                    "unexpected message during exec: {other:?}"
                )));
            }
        }
    }
}

async fn reset_on_worker(worker: &mut PythonWorker) -> Result<(), SandboxError> {
    let id = uuid::Uuid::new_v4().to_string();
    worker.send(HostMessage::Reset { id: id.clone() }).await?;
    loop {
        match worker.recv_timeout(Duration::from_secs(30)).await? {
            WorkerMessage::ResetResult { id: reply_id } if reply_id == id => return Ok(()),
            _ => continue,
        }
    }
}

fn dead_worker_record(code: &str, start: Instant) -> ExecutionRecord {
    ExecutionRecord {
        code: code.to_string(),
        output: String::new(),
        error: Some("interpreter process is not running; reset() restarts it".to_string()),
        images: Vec::new(),
        succeeded: false,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn decode_plots(plots: &[String]) -> Vec<PlotImage> {
    plots
        .iter()
        .filter_map(|b64| match BASE64.decode(b64) {
            Ok(data) => Some(PlotImage::png(data)),
            Err(e) => {
                tracing::warn!(%e, "dropping undecodable plot payload");
                None
            }
        })
        .collect()
}

/// Cap `text` at `max_chars` characters with an explicit marker.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... (truncated)")
}

/// The textual feedback a record produces for the reasoning engine.
pub fn format_record(record: &ExecutionRecord) -> String {
    let mut parts = Vec::new();
    if !record.output.is_empty() {
        parts.push(format!(
            "Output:\n{}",
            truncate_output(&record.output, MAX_OUTPUT_CHARS)
        ));
    }
    if let Some(error) = &record.error {
        parts.push(format!(
            "Error:\n{}",
            truncate_output(error, MAX_OUTPUT_CHARS)
        ));
    }
    if !record.images.is_empty() {
        parts.push(format!("Generated {} plot(s)", record.images.len()));
    }
    if parts.is_empty() {
        "Execution completed successfully (no output)".to_string()
    } else {
        parts.join("\n\n")
    }
}

/// Write every captured plot to `dir` as `plot_NNN.png`, numbered in
/// capture order across the whole history.
pub fn save_plots(records: &[ExecutionRecord], dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::new();
    for record in records {
        for image in &record.images {
            let path = dir.join(format!("plot_{:03}.png", paths.len()));
            std::fs::write(&path, &image.data)?;
            paths.push(path);
        }
    }
    Ok(paths)
}
