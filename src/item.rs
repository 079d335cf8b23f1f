//! Upload items, per-item state and retry records

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;

use crate::utils::sanitize_filename;

/// Handle for a payload that must be exported (e.g. transcoded) before transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHandle {
    /// Identifier understood by the exporter
    pub id: String,
    /// Source location, when the exporter works from a local file
    pub location: Option<PathBuf>,
}

impl ExportHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: path.to_string_lossy().to_string(),
            location: Some(path),
        }
    }
}

/// Item payload
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    File(PathBuf),
    Deferred(ExportHandle),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::File(_) => "file",
            Self::Deferred(_) => "deferred",
        }
    }
}

/// One media object to transfer
#[derive(Debug, Clone)]
pub struct UploadItem {
    filename: String,
    /// Sanitized once so every attempt targets the same object
    object_name: String,
    payload: Payload,
    content_type: String,
    size: Option<u64>,
}

impl UploadItem {
    pub fn from_bytes(
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let bytes = bytes.into();
        let filename = filename.into();
        Self {
            object_name: sanitize_filename(&filename),
            filename,
            size: Some(bytes.len() as u64),
            payload: Payload::Bytes(bytes),
            content_type: content_type.into(),
        }
    }

    pub fn from_file(
        path: impl Into<PathBuf>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        Self {
            object_name: sanitize_filename(&filename),
            filename,
            payload: Payload::File(path.into()),
            content_type: content_type.into(),
            size: None,
        }
    }

    pub fn deferred(
        handle: ExportHandle,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        Self {
            object_name: sanitize_filename(&filename),
            filename,
            payload: Payload::Deferred(handle),
            content_type: content_type.into(),
            size: None,
        }
    }

    /// Set a known size (file items)
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Key identifying the item within one run
    pub fn key(&self) -> &str {
        &self.filename
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Legal object name, stable across attempts
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

/// Which transport an item is sent through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Direct,
    Resumable,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Resumable => write!(f, "resumable"),
        }
    }
}

/// Per-item state owned by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Queued,
    Exporting,
    InFlight { bytes_sent: u64, total_bytes: u64 },
    Succeeded,
    Failed(String),
    /// Abandoned by `cancel_all`; not a failure
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
    }

    /// Fraction in `[0, 1]` for in-flight and succeeded items
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::InFlight {
                bytes_sent,
                total_bytes,
            } if *total_bytes > 0 => Some((*bytes_sent as f64 / *total_bytes as f64).min(1.0)),
            Self::InFlight { .. } => Some(0.0),
            Self::Succeeded => Some(1.0),
            _ => None,
        }
    }
}

/// An item together with its attempt counter
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub item: UploadItem,
    pub route: Route,
    /// Failed attempts so far
    pub attempts: u32,
}

impl RetryRecord {
    pub fn new(item: UploadItem, route: Route) -> Self {
        Self {
            item,
            route,
            attempts: 0,
        }
    }

    /// Count a failed attempt; true when another attempt is allowed under `max_attempts`
    pub fn register_failure(&mut self, max_attempts: u32) -> bool {
        self.attempts += 1;
        self.attempts < max_attempts
    }
}
