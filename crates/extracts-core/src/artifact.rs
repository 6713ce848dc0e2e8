//! Downloaded artifact checks.
//!
//! The portal sometimes serves an HTML error page or a truncated body with a 200, so a
//! download only counts once the file opens as a ZIP archive with at least one readable entry.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::ProcessError;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} does not exist")]
    Missing(PathBuf),

    #[error("artifact {0} is empty")]
    Empty(PathBuf),

    #[error("artifact {path} is not a zip archive: {reason}")]
    NotAnArchive { path: PathBuf, reason: String },

    #[error("artifact {0} contains no entries")]
    NoEntries(PathBuf),

    #[error("artifact {path} entry unreadable: {reason}")]
    UnreadableEntry { path: PathBuf, reason: String },

    #[error("artifact check aborted: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ArtifactError> for ProcessError {
    fn from(err: ArtifactError) -> Self {
        let path = match &err {
            ArtifactError::Missing(p)
            | ArtifactError::Empty(p)
            | ArtifactError::NoEntries(p)
            | ArtifactError::NotAnArchive { path: p, .. }
            | ArtifactError::UnreadableEntry { path: p, .. } => p.clone(),
            ArtifactError::Io(_) => PathBuf::new(),
        };
        ProcessError::ArtifactValidationFailed {
            path,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    pub size: u64,
    pub entries: usize,
}

/// Blocking check, in order: exists, non-empty, opens as ZIP, has entries, first entry reads.
pub fn validate_archive(path: &Path) -> Result<ArtifactReport, ArtifactError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::Missing(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if metadata.len() == 0 {
        return Err(ArtifactError::Empty(path.to_path_buf()));
    }

    let mut archive =
        zip::ZipArchive::new(File::open(path)?).map_err(|e| ArtifactError::NotAnArchive {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if archive.is_empty() {
        return Err(ArtifactError::NoEntries(path.to_path_buf()));
    }

    let unreadable = |reason: String| ArtifactError::UnreadableEntry {
        path: path.to_path_buf(),
        reason,
    };
    let entries = archive.len();
    let mut first = archive.by_index(0).map_err(|e| unreadable(e.to_string()))?;
    let mut sink = Vec::new();
    first
        .read_to_end(&mut sink)
        .map_err(|e| unreadable(e.to_string()))?;

    Ok(ArtifactReport {
        size: metadata.len(),
        entries,
    })
}

/// [`validate_archive`] off the async runtime.
pub async fn validate(path: PathBuf) -> Result<ArtifactReport, ArtifactError> {
    tokio::task::spawn_blocking(move || validate_archive(&path))
        .await
        .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?
}
