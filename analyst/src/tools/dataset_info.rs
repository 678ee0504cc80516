use std::path::Path;

use super::{Tool, ToolDefinition, ToolOutput, ToolParam, require_str};

const PREVIEW_ROWS: usize = 5;

/// Quick structural summary of a CSV file without loading it into the
/// interpreter. Header parsing is a plain comma split; quoted-field
/// subtleties are left to pandas inside the sandbox.
#[derive(Default)]
pub struct DatasetInfo;

#[async_trait::async_trait]
impl Tool for DatasetInfo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "dataset_info".into(),
            description: "Summarize a CSV dataset: size, column names, row count and the \
                          first few rows."
                .into(),
            params: vec![ToolParam {
                name: "dataset_path".into(),
                r#type: "str".into(),
                description: "Path to the CSV file".into(),
                required: true,
            }],
            returns: "str".into(),
        }
    }

    async fn execute(&self, args: &serde_json::Value) -> ToolOutput {
        let path_arg = match require_str(args, "dataset_path") {
            Ok(p) => p,
            Err(out) => return out,
        };
        let path = Path::new(path_arg);
        if !path.is_file() {
            return ToolOutput::err(format!("Dataset not found: {path_arg}"));
        }
        match summarize(path) {
            Ok(summary) => ToolOutput::ok(summary),
            Err(e) => ToolOutput::err(format!("Failed to read {path_arg}: {e}")),
        }
    }
}

fn summarize(path: &Path) -> std::io::Result<String> {
    let size = std::fs::metadata(path)?.len();
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();

    let header = lines.next().unwrap_or_default();
    let columns: Vec<&str> = if header.is_empty() {
        Vec::new()
    } else {
        header.split(',').map(str::trim).collect()
    };
    let rows = lines.clone().count();
    let preview: Vec<&str> = lines.take(PREVIEW_ROWS).collect();

    Ok(format!(
        "File: {}\nSize: {} bytes\nColumns ({}): {}\nRows: {}\nPreview:\n{}",
        path.display(),
        size,
        columns.len(),
        columns.join(", "),
        rows,
        preview.join("\n"),
    ))
}
