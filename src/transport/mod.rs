//! Transports and the contract they share with the scheduler
//!
//! A transport never returns an error across this boundary: every attempt ends
//! in a [`TransferOutcome`] value and the scheduler alone decides between
//! requeue and finalize.

pub mod direct;
pub mod resumable;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::UploadError;
use crate::http_logger::{self, ExchangeLog, ExchangeResult};
use crate::item::{Route, UploadItem};

pub use direct::DirectTransport;
pub use resumable::{ResumableSession, ResumableTransport, SessionState};

/// Result of one attempt at transferring an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    Retryable(UploadError),
    Terminal(UploadError),
    /// The run was cancelled while the attempt was running
    Cancelled,
}

impl TransferOutcome {
    pub fn from_error(err: UploadError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Terminal(err)
        }
    }
}

/// Receives progress and export phase changes from a running transfer
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, key: &str, bytes_sent: u64, total_bytes: u64);
    fn on_export_started(&self, key: &str);
    fn on_export_finished(&self, key: &str);
}

/// Observer that ignores everything
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_progress(&self, _key: &str, _bytes_sent: u64, _total_bytes: u64) {}
    fn on_export_started(&self, _key: &str) {}
    fn on_export_finished(&self, _key: &str) {}
}

/// Per-attempt context handed to a transport
#[derive(Clone)]
pub struct TransferContext {
    key: String,
    cancel: CancellationToken,
    observer: Arc<dyn TransferObserver>,
}

impl TransferContext {
    pub fn new(
        key: impl Into<String>,
        cancel: CancellationToken,
        observer: Arc<dyn TransferObserver>,
    ) -> Self {
        Self {
            key: key.into(),
            cancel,
            observer,
        }
    }

    /// Context with no observer and its own cancellation token
    pub fn detached(key: impl Into<String>) -> Self {
        Self::new(key, CancellationToken::new(), Arc::new(NullObserver))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn progress(&self, bytes_sent: u64, total_bytes: u64) {
        self.observer.on_progress(&self.key, bytes_sent, total_bytes);
    }

    pub fn export_started(&self) {
        self.observer.on_export_started(&self.key);
    }

    pub fn export_finished(&self) {
        self.observer.on_export_finished(&self.key);
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn route(&self) -> Route;

    /// Attempts the scheduler allows for items on this route
    fn max_attempts(&self) -> u32;

    /// Deferred exports currently running inside this transport
    fn exports_in_progress(&self) -> usize {
        0
    }

    async fn send(&self, item: &UploadItem, token: &str, ctx: &TransferContext) -> TransferOutcome;
}

/// HTTP client shared by a transport's requests
pub fn build_client(config: &Config) -> anyhow::Result<Client> {
    Ok(Client::builder().timeout(config.request_timeout).build()?)
}

/// Run a request and record it in the HTTP log; returns the response status,
/// headers and (for non-success statuses) the body text
pub(crate) async fn execute(
    log_dir: &Path,
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body_len: u64,
    request: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, HeaderMap, String), UploadError> {
    let start = Instant::now();
    let result = request.send().await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let log_request = || ExchangeLog {
        method,
        url,
        headers: http_logger::collect_headers(headers),
        body_len,
    };

    match result {
        Ok(response) => {
            let status = response.status();
            let response_headers = response.headers().clone();
            let body = if status.is_success() {
                String::new()
            } else {
                response.text().await.unwrap_or_default()
            };

            if http_logger::is_enabled() {
                http_logger::log_exchange(
                    log_dir,
                    &log_request(),
                    ExchangeResult::Response {
                        status: status.as_u16(),
                        headers: &response_headers,
                        body: Some(&body),
                    },
                    duration_ms,
                );
            }

            Ok((status, response_headers, body))
        }
        Err(e) => {
            if http_logger::is_enabled() {
                let message = e.to_string();
                http_logger::log_exchange(
                    log_dir,
                    &log_request(),
                    ExchangeResult::Error(&message),
                    duration_ms,
                );
            }
            Err(UploadError::from_reqwest(&e))
        }
    }
}
