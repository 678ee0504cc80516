mod dataset_info;
mod run_python;

pub use dataset_info::DatasetInfo;
pub use run_python::RunPython;

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::ActionRequest;

/// Declared parameter of a tool, rendered into the system prompt.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub r#type: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    pub returns: String,
}

impl ToolDefinition {
    /// One-line signature such as `run_python(code: str) -> str`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    format!("{}: {}", p.name, p.r#type)
                } else {
                    format!("{}?: {}", p.name, p.r#type)
                }
            })
            .collect();
        format!("{}({}) -> {}", self.name, params.join(", "), self.returns)
    }
}

/// What a tool hands back to the loop. Failures are data, not errors:
/// the content goes into the transcript either way.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, args: &serde_json::Value) -> ToolOutput;
}

/// Name-keyed tool set for one agent.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        self.tools
            .insert(tool.definition().name.clone(), Arc::new(tool));
        self
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one action. An unknown name is an ordinary failed output so
    /// the engine can read it and recover.
    pub async fn dispatch(&self, request: &ActionRequest) -> ToolOutput {
        match self.tools.get(&request.name) {
            Some(tool) => tool.execute(&request.args).await,
            None => ToolOutput::err(format!("Unknown tool: {}", request.name)),
        }
    }
}

/// Extract a required non-empty string arg, or return a failed output.
pub(crate) fn require_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolOutput> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolOutput::err(format!("Missing required parameter: {key}")))
}
