//! Upload scheduler - dispatches items to the transports and aggregates outcomes
//!
//! Every in-flight item runs in its own spawned task. Tasks report back
//! through [`RunState`], which is only touched with the lock held and never
//! across an await.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventReceiver, PipelineEvent, RunSummary};
use super::state::{Dispatch, RunState};
use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::error::UploadError;
use crate::item::{ExportHandle, Payload, RetryRecord, Route, UploadItem, UploadState};
use crate::recorder::{NoopRecorder, UploadRecord, UploadRecorder};
use crate::source::{ItemExporter, NoExporter};
use crate::transport::{
    DirectTransport, ResumableTransport, TransferContext, TransferObserver, TransferOutcome,
    Transport,
};

struct Inner {
    config: Arc<Config>,
    direct: Arc<dyn Transport>,
    resumable: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    recorder: Arc<dyn UploadRecorder>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    state: Mutex<RunState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self, route: Route) -> &Arc<dyn Transport> {
        match route {
            Route::Direct => &self.direct,
            Route::Resumable => &self.resumable,
        }
    }

    fn external_exports(&self) -> usize {
        self.direct.exports_in_progress() + self.resumable.exports_in_progress()
    }

    /// Publish an event; called with the state lock held so events keep their order
    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn progress(&self, generation: u64, key: &str, bytes_sent: u64, total_bytes: u64) {
        let mut state = self.lock();
        if let Some(fraction) = state.progress(generation, key, bytes_sent, total_bytes) {
            self.emit(PipelineEvent::Progress {
                filename: key.to_string(),
                fraction,
            });
        }
    }

    fn export_started(&self, generation: u64, key: &str) {
        self.lock().export_started(generation, key);
    }

    fn export_finished(&self, generation: u64, key: &str) {
        let mut state = self.lock();
        state.export_finished(generation, key);
        if let Some(event) = state.poll_completion(self.external_exports()) {
            self.emit(event);
        }
    }
}

/// Observer handed to one attempt; stale generations are ignored by the state
struct AttemptObserver {
    inner: Weak<Inner>,
    generation: u64,
}

impl TransferObserver for AttemptObserver {
    fn on_progress(&self, key: &str, bytes_sent: u64, total_bytes: u64) {
        if let Some(inner) = self.inner.upgrade() {
            inner.progress(self.generation, key, bytes_sent, total_bytes);
        }
    }

    fn on_export_started(&self, key: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.export_started(self.generation, key);
        }
    }

    fn on_export_finished(&self, key: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.export_finished(self.generation, key);
        }
    }
}

/// Builder for [`UploadScheduler`]
pub struct SchedulerBuilder {
    config: Arc<Config>,
    credentials: Arc<dyn CredentialProvider>,
    exporter: Arc<dyn ItemExporter>,
    recorder: Arc<dyn UploadRecorder>,
    direct: Option<Arc<dyn Transport>>,
    resumable: Option<Arc<dyn Transport>>,
}

impl SchedulerBuilder {
    pub fn exporter(mut self, exporter: Arc<dyn ItemExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn UploadRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Replace the HTTP direct transport
    pub fn direct_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.direct = Some(transport);
        self
    }

    /// Replace the HTTP resumable transport; the exporter is then unused
    pub fn resumable_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.resumable = Some(transport);
        self
    }

    pub fn build(self) -> Result<(UploadScheduler, EventReceiver)> {
        let direct: Arc<dyn Transport> = match self.direct {
            Some(transport) => transport,
            None => Arc::new(DirectTransport::new(self.config.clone())?),
        };
        let resumable: Arc<dyn Transport> = match self.resumable {
            Some(transport) => transport,
            None => Arc::new(ResumableTransport::new(
                self.config.clone(),
                self.credentials.clone(),
                self.exporter,
            )?),
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            state: Mutex::new(RunState::new(self.config.max_concurrency)),
            config: self.config,
            direct,
            resumable,
            credentials: self.credentials,
            recorder: self.recorder,
            events,
        };

        Ok((
            UploadScheduler {
                inner: Arc::new(inner),
            },
            receiver,
        ))
    }
}

/// Schedules uploads across the direct and resumable transports
///
/// Cloning is cheap; all clones share one run.
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<Inner>,
}

impl UploadScheduler {
    pub fn builder(
        config: Arc<Config>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            credentials,
            exporter: Arc::new(NoExporter),
            recorder: Arc::new(NoopRecorder),
            direct: None,
            resumable: None,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Pick a route from the payload kind and size
    pub fn route_for(&self, item: &UploadItem) -> Route {
        let size = match item.payload() {
            Payload::Deferred(_) => return Route::Resumable,
            Payload::Bytes(_) => item.size(),
            Payload::File(path) => item
                .size()
                .or_else(|| std::fs::metadata(path).ok().map(|m| m.len())),
        };

        match size {
            Some(size) if size >= self.inner.config.resumable_threshold => Route::Resumable,
            _ => Route::Direct,
        }
    }

    /// Enqueue an item on its natural route; `None` if the run was cancelled
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, item: UploadItem) -> Option<Route> {
        let route = self.route_for(&item);
        self.enqueue_with_route(item, route).then_some(route)
    }

    pub fn enqueue_direct_bytes(
        &self,
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> bool {
        let item = UploadItem::from_bytes(bytes, filename, content_type);
        self.enqueue_with_route(item, Route::Direct)
    }

    pub fn enqueue_direct_file(
        &self,
        path: impl Into<PathBuf>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> bool {
        let item = UploadItem::from_file(path, filename, content_type);
        self.enqueue_with_route(item, Route::Direct)
    }

    pub fn enqueue_resumable(
        &self,
        handle: ExportHandle,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> bool {
        let item = UploadItem::deferred(handle, filename, content_type);
        self.enqueue_with_route(item, Route::Resumable)
    }

    /// Enqueue with an explicit route
    pub fn enqueue_with_route(&self, item: UploadItem, route: Route) -> bool {
        let key = item.key().to_string();
        let accepted = self.inner.lock().push(RetryRecord::new(item, route));
        if !accepted {
            warn!("Run was cancelled, ignoring {} until reset", key);
            return false;
        }

        debug!("Enqueued {} via {}", key, route);
        pump(&self.inner);
        true
    }

    /// Abandon the run and wait for every in-flight task to exit
    ///
    /// Queued items are discarded without being marked failed and the
    /// completion event will not fire for this run.
    pub async fn cancel_all(&self) {
        let handles = self.inner.lock().cancel();
        info!("Cancelling {} in-flight upload(s)", handles.len());

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Upload task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Start a new run: clears queues, counters and the completion latch
    pub fn reset_state(&self) {
        self.inner.lock().reset();
        debug!("Scheduler state reset");
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queued_count()
    }

    /// Exports currently running, as seen by the scheduler and the transports
    pub fn exports_in_progress(&self) -> usize {
        self.inner.lock().exports_in_progress().max(self.inner.external_exports())
    }

    pub fn state(&self, key: &str) -> Option<UploadState> {
        self.inner.lock().state(key)
    }

    pub fn states(&self) -> Vec<(String, UploadState)> {
        self.inner.lock().states()
    }

    pub fn summary(&self) -> RunSummary {
        self.inner.lock().summary()
    }
}

/// Start tasks until the concurrency limit is reached or the queues are empty
fn pump(inner: &Arc<Inner>) {
    let mut state = inner.lock();
    while let Some(dispatch) = state.next_dispatch() {
        let key = dispatch.record.item.key().to_string();
        let generation = dispatch.generation;
        let handle = tokio::spawn(run_attempt(Arc::clone(inner), dispatch));
        state.attach_handle(&key, generation, handle);
    }
}

async fn run_attempt(inner: Arc<Inner>, dispatch: Dispatch) {
    let Dispatch {
        record,
        delayed,
        generation,
        cancel,
    } = dispatch;

    let outcome = if delayed && !retry_delay(&inner, &cancel).await {
        TransferOutcome::Cancelled
    } else {
        attempt(&inner, &record, generation, cancel).await
    };

    if let TransferOutcome::Retryable(err) = &outcome {
        if err.needs_refresh() {
            spawn_refresh(&inner);
        }
    }

    if outcome == TransferOutcome::Success {
        record_upload(&inner, &record.item).await;
    }

    let max_attempts = inner.transport(record.route).max_attempts();
    {
        let mut state = inner.lock();
        let events = state.finish(
            record,
            generation,
            outcome,
            max_attempts,
            inner.external_exports(),
        );
        for event in events {
            inner.emit(event);
        }
    }

    pump(&inner);
}

/// Wait out the retry-queue delay; false when cancelled first
async fn retry_delay(inner: &Inner, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(inner.config.retry_queue_delay) => true,
    }
}

async fn attempt(
    inner: &Arc<Inner>,
    record: &RetryRecord,
    generation: u64,
    cancel: CancellationToken,
) -> TransferOutcome {
    let key = record.item.key();
    let token = match inner.credentials.current_token().await {
        Some(token) => token,
        None => {
            warn!("No credential available for {}", key);
            return TransferOutcome::Terminal(UploadError::NotAuthenticated);
        }
    };

    let observer = Arc::new(AttemptObserver {
        inner: Arc::downgrade(inner),
        generation,
    });
    let ctx = TransferContext::new(key, cancel, observer);
    let transport = inner.transport(record.route);

    debug!(
        "Starting {} upload of {} from {} (attempt {})",
        record.route,
        key,
        record.item.payload().kind(),
        record.attempts + 1
    );
    transport.send(&record.item, &token, &ctx).await
}

fn spawn_refresh(inner: &Arc<Inner>) {
    let credentials = inner.credentials.clone();
    tokio::spawn(async move {
        match credentials.refresh().await {
            Ok(()) => info!("Credential refreshed"),
            Err(e) => warn!("Credential refresh failed: {}", e),
        }
    });
}

async fn record_upload(inner: &Inner, item: &UploadItem) {
    let record = UploadRecord {
        filename: item.filename().to_string(),
        bucket: inner.config.bucket.clone(),
        object_path: inner.config.object_path(item.object_name()),
        content_type: item.content_type().to_string(),
        size: item.size(),
        uploaded_at: Utc::now(),
    };

    if let Err(e) = inner.recorder.record(&record).await {
        warn!("Failed to record upload of {}: {}", item.filename(), e);
    }
}
