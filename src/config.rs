//! Configuration module - storage endpoint and pipeline tuning

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default concurrency shared by both transports
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default resumable chunk size (5 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Items at or above this size use the resumable transport (6 MiB)
pub const DEFAULT_RESUMABLE_THRESHOLD: u64 = 6 * 1024 * 1024;

/// tus protocol version sent with every resumable request
pub const TUS_VERSION: &str = "1.0.0";

/// Optional configuration parameters for Config::new()
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub folder_prefix: Option<String>,
    pub max_concurrency: Option<usize>,
    pub retry_queue_delay: Option<Duration>,
    pub direct_max_attempts: Option<u32>,
    pub create_max_retries: Option<u32>,
    pub chunk_max_retries: Option<u32>,
    pub chunk_backoff_unit: Option<Duration>,
    pub chunk_size: Option<usize>,
    pub resumable_threshold: Option<u64>,
    pub request_timeout: Option<Duration>,
    pub chunk_timeout: Option<Duration>,
    pub cache_control: Option<String>,
    pub staging_dir: Option<PathBuf>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage API root, e.g. `https://project.example.co/storage/v1`
    pub base_url: String,
    pub bucket: String,
    /// User-scoped folder every object path starts with
    pub folder_prefix: String,
    pub max_concurrency: usize,
    /// Delay before an item from the retry queue is started
    pub retry_queue_delay: Duration,
    pub direct_max_attempts: u32,
    pub create_max_retries: u32,
    pub chunk_max_retries: u32,
    /// Chunk backoff is `retry_count * chunk_backoff_unit`
    pub chunk_backoff_unit: Duration,
    pub chunk_size: usize,
    pub resumable_threshold: u64,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub cache_control: String,
    pub staging_dir: PathBuf,
}

impl Config {
    /// Create a new Config with required base_url and bucket, plus optional settings
    pub fn new(base_url: String, bucket: String, options: ConfigOptions) -> Result<Arc<Self>> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("base_url cannot be empty"));
        }

        // Plain http is kept as given so local emulators keep working
        let base_url = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            format!("https://{}", base_url)
        };

        let bucket = bucket.trim().to_string();
        if bucket.is_empty() {
            return Err(anyhow!("bucket cannot be empty"));
        }

        let folder_prefix = options
            .folder_prefix
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_else(|| "uploads".to_string());
        if folder_prefix.is_empty() {
            return Err(anyhow!("folder_prefix cannot be empty"));
        }

        let max_concurrency = options.max_concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be at least 1"));
        }

        let chunk_size = options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(anyhow!("chunk_size must be at least 1 byte"));
        }

        Ok(Arc::new(Self {
            base_url,
            bucket,
            folder_prefix,
            max_concurrency,
            retry_queue_delay: options.retry_queue_delay.unwrap_or(Duration::from_secs(2)),
            direct_max_attempts: options.direct_max_attempts.unwrap_or(3).max(1),
            create_max_retries: options.create_max_retries.unwrap_or(3),
            chunk_max_retries: options.chunk_max_retries.unwrap_or(5),
            chunk_backoff_unit: options.chunk_backoff_unit.unwrap_or(Duration::from_secs(2)),
            chunk_size,
            resumable_threshold: options
                .resumable_threshold
                .unwrap_or(DEFAULT_RESUMABLE_THRESHOLD),
            request_timeout: options.request_timeout.unwrap_or(Duration::from_secs(30)),
            chunk_timeout: options.chunk_timeout.unwrap_or(Duration::from_secs(300)),
            cache_control: options.cache_control.unwrap_or_else(|| "3600".to_string()),
            staging_dir: options
                .staging_dir
                .unwrap_or_else(|| std::env::temp_dir().join("cloudsweep-staging")),
        }))
    }

    /// Object path inside the bucket for an already sanitized file name
    pub fn object_path(&self, sanitized_name: &str) -> String {
        format!("{}/{}", self.folder_prefix, sanitized_name)
    }

    /// Endpoint for single-request uploads of `object_path`
    pub fn direct_url(&self, object_path: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, self.bucket, object_path)
    }

    /// Endpoint that creates resumable sessions
    pub fn resumable_url(&self) -> String {
        format!("{}/upload/resumable", self.base_url)
    }
}
