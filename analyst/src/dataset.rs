//! Dataset identifier resolution.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset not found: {id} (available: {available})")]
    NotFound { id: String, available: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps a dataset identifier to a concrete file path. An identifier is
/// either a path that exists as given or a file name under the
/// configured datasets directory. Resolution failures happen before a
/// run starts, never silently inside one.
pub struct DatasetResolver {
    datasets_dir: PathBuf,
}

impl DatasetResolver {
    pub fn new(datasets_dir: impl Into<PathBuf>) -> Self {
        Self {
            datasets_dir: datasets_dir.into(),
        }
    }

    pub fn resolve(&self, id: &str) -> Result<PathBuf, DatasetError> {
        let direct = Path::new(id);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        let under_dir = self.datasets_dir.join(id);
        if under_dir.is_file() {
            return Ok(under_dir);
        }
        Err(DatasetError::NotFound {
            id: id.to_string(),
            available: self.list_available().join(", "),
        })
    }

    /// File names under the datasets directory, sorted. An unreadable
    /// directory just lists as empty.
    pub fn list_available(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.datasets_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}
