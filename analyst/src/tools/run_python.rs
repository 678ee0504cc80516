use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::{Tool, ToolDefinition, ToolOutput, ToolParam, require_str};
use crate::sandbox::{Sandbox, format_record};

/// Executes code in the run's shared sandbox. The interpreter
/// namespace persists across calls, so earlier variables stay visible.
pub struct RunPython {
    sandbox: Arc<Mutex<Sandbox>>,
    timeout: Duration,
}

impl RunPython {
    pub fn new(sandbox: Arc<Mutex<Sandbox>>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }
}

#[async_trait::async_trait]
impl Tool for RunPython {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_python".into(),
            description: "Execute Python code in a persistent session. Variables defined in \
                          earlier calls remain available. Use print() to inspect values and \
                          plt.show() to emit plots."
                .into(),
            params: vec![ToolParam {
                name: "code".into(),
                r#type: "str".into(),
                description: "Python code to execute".into(),
                required: true,
            }],
            returns: "str".into(),
        }
    }

    async fn execute(&self, args: &serde_json::Value) -> ToolOutput {
        let code = match require_str(args, "code") {
            Ok(code) => code,
            Err(out) => return out,
        };
        let mut sandbox = self.sandbox.lock().await;
        match sandbox.execute(code, self.timeout).await {
            Ok(record) => ToolOutput {
                success: record.succeeded,
                content: format_record(&record),
            },
            Err(e) => ToolOutput::err(format!("Execution failed: {e}")),
        }
    }
}
