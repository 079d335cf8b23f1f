//! Resumable transport - tus create / chunk / complete protocol
//!
//! A session is opened with a POST declaring the total length and object
//! metadata, then the staged payload is sent in fixed-size PATCH requests.
//! The session offset is only ever taken from the server's `Upload-Offset`
//! response header, so a retried chunk always restarts at confirmed bytes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION,
};
use reqwest::{Client, StatusCode, Url};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::{build_client, execute, TransferContext, TransferOutcome, Transport};
use crate::config::{Config, TUS_VERSION};
use crate::credentials::CredentialProvider;
use crate::error::{classify_status, UploadError};
use crate::item::{ExportHandle, Payload, Route, UploadItem};
use crate::source::ItemExporter;
use crate::utils::{StagedFile, StagingArea};

const TUS_RESUMABLE: &str = "tus-resumable";
const UPLOAD_LENGTH: &str = "upload-length";
const UPLOAD_OFFSET: &str = "upload-offset";
const UPLOAD_METADATA: &str = "upload-metadata";
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Per-session protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    SessionOpen,
    TransferringChunk,
    Completed,
    Failed,
}

/// Server-side upload context plus the local artifact it is fed from
#[derive(Debug)]
pub struct ResumableSession {
    key: String,
    url: Url,
    offset: u64,
    total: u64,
    content_type: String,
    source: StagedFile,
    state: SessionState,
}

impl ResumableSession {
    fn open(key: &str, url: Url, source: StagedFile, content_type: &str) -> Self {
        let total = source.len();
        debug!("Session for {} opened at {}", key, url);
        Self {
            key: key.to_string(),
            url,
            offset: 0,
            total,
            content_type: content_type.to_string(),
            source,
            state: SessionState::SessionOpen,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.total
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.key, self.state, next);
        self.state = next;
    }

    /// Accept a server-confirmed offset
    fn confirm(&mut self, confirmed: u64) -> Result<(), UploadError> {
        if confirmed < self.offset || confirmed > self.total {
            return Err(UploadError::ProtocolViolation(format!(
                "server confirmed offset {} outside {}..={}",
                confirmed, self.offset, self.total
            )));
        }
        if confirmed == self.offset {
            return Err(UploadError::Network(format!(
                "server accepted no bytes at offset {}",
                confirmed
            )));
        }
        self.offset = confirmed;
        Ok(())
    }

    /// Read the next chunk starting at the confirmed offset
    async fn read_chunk(&self, chunk_size: usize) -> Result<Vec<u8>, UploadError> {
        let remaining = self.total - self.offset;
        let len = remaining.min(chunk_size as u64) as usize;

        let mut file = tokio::fs::File::open(self.source.path())
            .await
            .map_err(|e| UploadError::Staging(e.to_string()))?;
        file.seek(std::io::SeekFrom::Start(self.offset))
            .await
            .map_err(|e| UploadError::Staging(e.to_string()))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| UploadError::Staging(e.to_string()))?;
        Ok(buf)
    }
}

/// Result of a create request
enum Created {
    Session(Url),
    AlreadyExists,
}

/// Result of a chunk request
enum ChunkAccepted {
    Offset(u64),
    AlreadyExists,
}

/// Decrements the export counter and notifies the observer when dropped
struct ExportGuard<'a> {
    counter: &'a AtomicUsize,
    ctx: &'a TransferContext,
}

impl<'a> ExportGuard<'a> {
    fn start(counter: &'a AtomicUsize, ctx: &'a TransferContext) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ctx.export_started();
        Self { counter, ctx }
    }
}

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.ctx.export_finished();
    }
}

/// Build the tus `Upload-Metadata` header value
pub fn encode_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, BASE64.encode(v.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct ResumableTransport {
    config: Arc<Config>,
    client: Client,
    staging: StagingArea,
    credentials: Arc<dyn CredentialProvider>,
    exporter: Arc<dyn ItemExporter>,
    exports_in_progress: AtomicUsize,
}

impl ResumableTransport {
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<dyn CredentialProvider>,
        exporter: Arc<dyn ItemExporter>,
    ) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self::with_client(config, client, credentials, exporter))
    }

    pub fn with_client(
        config: Arc<Config>,
        client: Client,
        credentials: Arc<dyn CredentialProvider>,
        exporter: Arc<dyn ItemExporter>,
    ) -> Self {
        let staging = StagingArea::new(config.staging_dir.clone());
        Self {
            config,
            client,
            staging,
            credentials,
            exporter,
            exports_in_progress: AtomicUsize::new(0),
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.config.chunk_backoff_unit * retry_count
    }

    /// Refresh the credential and return the token to use next
    async fn refreshed_token(&self, current: &str) -> String {
        if let Err(e) = self.credentials.refresh().await {
            warn!("Credential refresh failed: {}", e);
        }
        self.credentials
            .current_token()
            .await
            .unwrap_or_else(|| current.to_string())
    }

    /// Resolve a deferred export into a staged file
    async fn export(
        &self,
        handle: &ExportHandle,
        ctx: &TransferContext,
    ) -> Result<StagedFile, UploadError> {
        let _guard = ExportGuard::start(&self.exports_in_progress, ctx);
        info!("Exporting {} before transfer", handle.id);

        let mut staged = self
            .staging
            .reserve_output(self.exporter.output_extension())
            .await
            .map_err(|e| UploadError::Staging(format!("{}: {}", handle.id, e)))?;

        self.exporter
            .export(handle, staged.path())
            .await
            .map_err(|e| UploadError::ExportFailure(e.to_string()))?;

        staged
            .refresh_len()
            .await
            .map_err(|e| UploadError::ExportFailure(e.to_string()))?;
        Ok(staged)
    }

    async fn materialize(
        &self,
        item: &UploadItem,
        label: &str,
        ctx: &TransferContext,
    ) -> Result<StagedFile, UploadError> {
        let staged = match item.payload() {
            Payload::Deferred(handle) => return self.export(handle, ctx).await,
            Payload::Bytes(bytes) => self.staging.stage_bytes(label, bytes).await,
            Payload::File(path) => self.staging.stage_copy(label, path).await,
        };
        staged.map_err(|e| UploadError::Staging(format!("{}: {}", item.filename(), e)))
    }

    fn auth_headers(&self, token: &str) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| UploadError::NotAuthenticated)?,
        );
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        Ok(headers)
    }

    async fn create(
        &self,
        object_path: &str,
        content_type: &str,
        total: u64,
        token: &str,
    ) -> Result<Created, UploadError> {
        let endpoint = self.config.resumable_url();
        let metadata = encode_metadata(&[
            ("bucketName", self.config.bucket.as_str()),
            ("objectName", object_path),
            ("contentType", content_type),
            ("cacheControl", self.config.cache_control.as_str()),
        ]);

        let mut headers = self.auth_headers(token)?;
        headers.insert(UPLOAD_LENGTH, HeaderValue::from(total));
        headers.insert(
            UPLOAD_METADATA,
            HeaderValue::from_str(&metadata)
                .map_err(|e| UploadError::ProtocolViolation(e.to_string()))?,
        );
        headers.insert("x-upsert", HeaderValue::from_static("true"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));

        let request = self.client.post(&endpoint).headers(headers.clone());
        let (status, response_headers, body) =
            execute(self.staging.dir(), "POST", &endpoint, &headers, 0, request).await?;

        if status == StatusCode::CONFLICT {
            return Ok(Created::AlreadyExists);
        }
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let location = response_headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                UploadError::ProtocolViolation("create response has no Location header".into())
            })?;

        let base = Url::parse(&endpoint)
            .map_err(|e| UploadError::ProtocolViolation(format!("bad endpoint: {}", e)))?;
        let url = base.join(location).map_err(|e| {
            UploadError::ProtocolViolation(format!("bad Location {:?}: {}", location, e))
        })?;

        Ok(Created::Session(url))
    }

    async fn send_chunk(
        &self,
        session: &ResumableSession,
        chunk: Vec<u8>,
        token: &str,
    ) -> Result<ChunkAccepted, UploadError> {
        let len = chunk.len() as u64;
        let mut headers = self.auth_headers(token)?;
        headers.insert(UPLOAD_OFFSET, HeaderValue::from(session.offset));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OFFSET_OCTET_STREAM));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));

        let url = session.url.as_str();
        let request = self
            .client
            .patch(url)
            .timeout(self.config.chunk_timeout)
            .headers(headers.clone())
            .body(chunk);
        let (status, response_headers, body) =
            execute(self.staging.dir(), "PATCH", url, &headers, len, request).await?;

        if status == StatusCode::CONFLICT {
            return Ok(ChunkAccepted::AlreadyExists);
        }
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        response_headers
            .get(UPLOAD_OFFSET)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(ChunkAccepted::Offset)
            .ok_or_else(|| {
                UploadError::ProtocolViolation("chunk response has no Upload-Offset".into())
            })
    }

    /// Create step with bounded retries
    async fn open_session(
        &self,
        item: &UploadItem,
        object_path: &str,
        total: u64,
        token: &mut String,
    ) -> Result<Option<Url>, UploadError> {
        let mut retries = 0u32;
        loop {
            match self
                .create(object_path, item.content_type(), total, token)
                .await
            {
                Ok(Created::Session(url)) => return Ok(Some(url)),
                Ok(Created::AlreadyExists) => return Ok(None),
                Err(e) if e.is_retryable() && retries < self.config.create_max_retries => {
                    retries += 1;
                    warn!(
                        "Create for {} failed (retry {}/{}): {}",
                        item.filename(),
                        retries,
                        self.config.create_max_retries,
                        e
                    );
                    if e.needs_refresh() {
                        *token = self.refreshed_token(token).await;
                    }
                    tokio::time::sleep(self.backoff(retries)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Chunk loop; returns once the session is complete
    async fn transfer(
        &self,
        session: &mut ResumableSession,
        token: &mut String,
        ctx: &TransferContext,
    ) -> Result<(), UploadError> {
        let mut retries = 0u32;

        while !session.is_complete() {
            let chunk = session.read_chunk(self.config.chunk_size).await?;
            session.transition(SessionState::TransferringChunk);

            let accepted = match self.send_chunk(session, chunk, token).await {
                Ok(ChunkAccepted::Offset(confirmed)) => session.confirm(confirmed),
                Ok(ChunkAccepted::AlreadyExists) => {
                    info!(
                        "{} already exists remotely, ending session",
                        session.key
                    );
                    session.offset = session.total;
                    Ok(())
                }
                Err(e) => Err(e),
            };

            match accepted {
                Ok(()) => {
                    retries = 0;
                    session.transition(SessionState::SessionOpen);
                    ctx.progress(session.offset, session.total);
                }
                Err(e) if e.is_retryable() && retries < self.config.chunk_max_retries => {
                    retries += 1;
                    session.transition(SessionState::SessionOpen);
                    let delay = self.backoff(retries);
                    warn!(
                        "Chunk at offset {} for {} failed (retry {}/{} in {:?}): {}",
                        session.offset,
                        session.key,
                        retries,
                        self.config.chunk_max_retries,
                        delay,
                        e
                    );
                    if e.needs_refresh() {
                        *token = self.refreshed_token(token).await;
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn upload(
        &self,
        item: &UploadItem,
        token: &str,
        ctx: &TransferContext,
    ) -> Result<(), UploadError> {
        let object_name = item.object_name();
        let object_path = self.config.object_path(object_name);
        let mut token = token.to_string();

        let staged = self.materialize(item, object_name, ctx).await?;
        let total = staged.len();
        ctx.progress(0, total);

        debug!("Session for {}: {:?}", item.filename(), SessionState::Creating);
        let url = match self
            .open_session(item, &object_path, total, &mut token)
            .await?
        {
            Some(url) => url,
            None => {
                info!("{} already exists remotely, nothing to transfer", object_path);
                ctx.progress(total, total);
                return Ok(());
            }
        };

        let mut session = ResumableSession::open(item.key(), url, staged, item.content_type());
        match self.transfer(&mut session, &mut token, ctx).await {
            Ok(()) => {
                session.transition(SessionState::Completed);
                info!(
                    "Resumable upload of {} complete ({} bytes)",
                    object_path, session.total
                );
                Ok(())
            }
            Err(e) => {
                session.transition(SessionState::Failed);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for ResumableTransport {
    fn route(&self) -> Route {
        Route::Resumable
    }

    /// Retries happen inside the protocol; exhaustion is terminal
    fn max_attempts(&self) -> u32 {
        1
    }

    fn exports_in_progress(&self) -> usize {
        self.exports_in_progress.load(Ordering::SeqCst)
    }

    async fn send(&self, item: &UploadItem, token: &str, ctx: &TransferContext) -> TransferOutcome {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("Resumable upload of {} cancelled", item.filename());
                TransferOutcome::Cancelled
            }
            result = self.upload(item, token, ctx) => match result {
                Ok(()) => TransferOutcome::Success,
                Err(e) => {
                    warn!("Resumable upload of {} failed: {}", item.filename(), e);
                    TransferOutcome::Terminal(e)
                }
            },
        }
    }
}
