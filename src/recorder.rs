//! Post-upload metadata recording
//!
//! Recording runs after a successful upload. Its failures are logged by the
//! scheduler and never change the outcome of the upload.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Description of one uploaded object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRecord {
    pub filename: String,
    pub bucket: String,
    pub object_path: String,
    pub content_type: String,
    pub size: Option<u64>,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait UploadRecorder: Send + Sync {
    async fn record(&self, record: &UploadRecord) -> Result<()>;
}

/// Recorder that discards everything
pub struct NoopRecorder;

#[async_trait]
impl UploadRecorder for NoopRecorder {
    async fn record(&self, _record: &UploadRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON line per uploaded object to a manifest file
pub struct ManifestRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read back all records in a manifest
    pub fn load(path: &std::path::Path) -> Result<Vec<UploadRecord>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }
}

#[async_trait]
impl UploadRecorder for ManifestRecorder {
    async fn record(&self, record: &UploadRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
