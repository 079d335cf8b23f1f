//! cloudsweep library - media backup upload pipeline
//!
//! Items are enqueued on an [`UploadScheduler`], which sends them through a
//! single-request direct transport or a chunked resumable (tus) transport
//! and reports progress and completion as [`PipelineEvent`]s.

pub mod config;
pub mod credentials;
pub mod error;
pub mod http_logger;
pub mod item;
pub mod recorder;
pub mod scheduler;
pub mod source;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, ConfigOptions};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use error::UploadError;
pub use item::{ExportHandle, Payload, Route, UploadItem, UploadState};
pub use recorder::{ManifestRecorder, NoopRecorder, UploadRecord, UploadRecorder};
pub use scheduler::{EventReceiver, PipelineEvent, RunSummary, UploadScheduler};
pub use source::{CommandExporter, ItemExporter, NoExporter};
pub use transport::{TransferContext, TransferObserver, TransferOutcome, Transport};
