//! Classification of files a run leaves behind.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Notebook,
    Submission,
    Artifact,
}

pub fn classify(path: &Path) -> ArtifactKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".ipynb") {
        ArtifactKind::Notebook
    } else if name.ends_with(".csv") && name.contains("submission") {
        ArtifactKind::Submission
    } else {
        ArtifactKind::Artifact
    }
}

/// Payload items for an `artifacts` event.
pub fn describe(paths: &[std::path::PathBuf]) -> Vec<serde_json::Value> {
    paths
        .iter()
        .map(|path| {
            serde_json::json!({
                "path": path.display().to_string(),
                "kind": classify(path),
            })
        })
        .collect()
}
