//! Transfer-local staging artifacts
//!
//! Every transfer works on its own copy of the payload so the source can be
//! mutated or cleaned up concurrently. Artifacts carry a globally unique name
//! and are removed when the [`StagedFile`] is dropped.

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs;
use uuid::Uuid;

/// Directory holding staging artifacts
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

/// A staged payload, deleted on drop
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    len: u64,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a unique, still empty artifact path
    async fn reserve(&self, label: &str) -> std::io::Result<TempPath> {
        fs::create_dir_all(&self.dir).await?;
        let label: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            .take(64)
            .collect();
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", Uuid::new_v4().simple()))
            .suffix(&format!(".{}.part", label))
            .tempfile_in(&self.dir)?;
        Ok(file.into_temp_path())
    }

    /// Write an in-memory payload to a new artifact
    pub async fn stage_bytes(&self, label: &str, bytes: &[u8]) -> std::io::Result<StagedFile> {
        let path = self.reserve(label).await?;
        fs::write(&path, bytes).await?;
        Ok(StagedFile {
            path,
            len: bytes.len() as u64,
        })
    }

    /// Copy a file-backed payload to a new artifact
    pub async fn stage_copy(&self, label: &str, source: &Path) -> std::io::Result<StagedFile> {
        let path = self.reserve(label).await?;
        let len = fs::copy(source, &path).await?;
        Ok(StagedFile { path, len })
    }

    /// Reserve an empty artifact for a producer that writes it later (e.g. an export)
    ///
    /// The artifact keeps `extension` as its real extension so tools that pick
    /// an output format from the file name see the right one.
    pub async fn reserve_output(&self, extension: &str) -> std::io::Result<StagedFile> {
        fs::create_dir_all(&self.dir).await?;
        let extension: String = extension
            .trim_start_matches('.')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-export", Uuid::new_v4().simple()))
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.dir)?;
        Ok(StagedFile {
            path: file.into_temp_path(),
            len: 0,
        })
    }

    /// Number of artifacts currently present (the HTTP log is not an artifact)
    pub fn artifact_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .filter(|e| e.file_name() != crate::http_logger::LOG_FILE_NAME)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Re-read the length after an external producer wrote the artifact
    pub async fn refresh_len(&mut self) -> std::io::Result<u64> {
        self.len = fs::metadata(&self.path).await?.len();
        Ok(self.len)
    }
}
