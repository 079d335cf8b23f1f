//! Direct transport - one request carrying the whole payload

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE,
};
use reqwest::{Body, Client, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{build_client, execute, TransferContext, TransferOutcome, Transport};
use crate::config::Config;
use crate::error::{classify_status, UploadError};
use crate::item::{Payload, Route, UploadItem};
use crate::utils::{StagedFile, StagingArea};

/// Read size for the streamed request body; each read is one progress update
const PROGRESS_CHUNK: usize = 64 * 1024;

pub struct DirectTransport {
    config: Arc<Config>,
    client: Client,
    staging: StagingArea,
}

impl DirectTransport {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: Arc<Config>, client: Client) -> Self {
        let staging = StagingArea::new(config.staging_dir.clone());
        Self {
            config,
            client,
            staging,
        }
    }

    /// Copy the payload into a transfer-local artifact
    async fn stage(&self, item: &UploadItem, label: &str) -> Result<StagedFile, UploadError> {
        let staged = match item.payload() {
            Payload::Bytes(bytes) => self.staging.stage_bytes(label, bytes).await,
            Payload::File(path) => self.staging.stage_copy(label, path).await,
            Payload::Deferred(handle) => {
                return Err(UploadError::Staging(format!(
                    "deferred item {} needs the resumable transport",
                    handle.id
                )))
            }
        };
        staged.map_err(|e| UploadError::Staging(format!("{}: {}", item.filename(), e)))
    }

    fn headers(&self, item: &UploadItem, token: &str, len: u64) -> Result<HeaderMap, UploadError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| UploadError::Rejected {
            status: 0,
            body: format!("invalid header value: {}", e),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).map_err(invalid)?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(item.content_type()).map_err(invalid)?,
        );
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_str(&format!("max-age={}", self.config.cache_control))
                .map_err(invalid)?,
        );
        headers.insert("x-upsert", HeaderValue::from_static("true"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        Ok(headers)
    }

    async fn upload(
        &self,
        item: &UploadItem,
        token: &str,
        ctx: &TransferContext,
    ) -> Result<(), UploadError> {
        let object_name = item.object_name();
        let object_path = self.config.object_path(object_name);
        let url = self.config.direct_url(&object_path);

        // Dropping `staged` removes the artifact on every exit path
        let staged = self.stage(item, object_name).await?;
        let total = staged.len();
        ctx.progress(0, total);

        let file = tokio::fs::File::open(staged.path())
            .await
            .map_err(|e| UploadError::Staging(e.to_string()))?;

        let progress_ctx = ctx.clone();
        let mut sent = 0u64;
        let stream = ReaderStream::with_capacity(file, PROGRESS_CHUNK).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                progress_ctx.progress(sent.min(total), total);
            }
            chunk
        });

        let headers = self.headers(item, token, total)?;
        debug!("POST {} ({} bytes)", url, total);

        let request = self
            .client
            .post(&url)
            .headers(headers.clone())
            .body(Body::wrap_stream(stream));
        let (status, _, body) = execute(
            self.staging.dir(),
            "POST",
            &url,
            &headers,
            total,
            request,
        )
        .await?;

        if status.is_success() || status == StatusCode::CONFLICT {
            if status == StatusCode::CONFLICT {
                info!("{} already exists remotely, treating as uploaded", object_path);
            }
            ctx.progress(total, total);
            return Ok(());
        }

        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn route(&self) -> Route {
        Route::Direct
    }

    fn max_attempts(&self) -> u32 {
        self.config.direct_max_attempts
    }

    async fn send(&self, item: &UploadItem, token: &str, ctx: &TransferContext) -> TransferOutcome {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("Direct upload of {} cancelled", item.filename());
                TransferOutcome::Cancelled
            }
            result = self.upload(item, token, ctx) => match result {
                Ok(()) => TransferOutcome::Success,
                Err(e) => {
                    warn!("Direct upload of {} failed: {}", item.filename(), e);
                    TransferOutcome::from_error(e)
                }
            },
        }
    }
}
