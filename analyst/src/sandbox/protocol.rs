//! JSON-lines wire protocol between the host and the Python worker.
//! One JSON object per line in each direction over stdin/stdout.

use serde::{Deserialize, Serialize};

/// Host -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run a code block with a wall-clock limit in seconds (0 = none).
    Exec {
        id: String,
        code: String,
        timeout_secs: u64,
    },
    /// Merge JSON values into the interpreter namespace.
    Inject {
        id: String,
        vars: serde_json::Map<String, serde_json::Value>,
    },
    /// Clear the namespace and redo the convenience pre-imports.
    Reset { id: String },
    Shutdown,
}

/// Worker -> host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once at startup. `hard_timeout` reports whether the worker
    /// can enforce limits with SIGALRM on its main thread.
    Ready { hard_timeout: bool },
    ExecResult {
        id: String,
        output: String,
        error: Option<String>,
        /// Base64-encoded PNGs captured from intercepted plot `show` calls.
        plots: Vec<String>,
        success: bool,
    },
    InjectResult { id: String },
    ResetResult { id: String },
}
