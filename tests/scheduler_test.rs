//! End-to-end tests for the upload scheduler

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudsweep::config::{Config, ConfigOptions};
use cloudsweep::credentials::{CredentialProvider, StaticCredentials};
use cloudsweep::error::UploadError;
use cloudsweep::item::{ExportHandle, Route, UploadItem, UploadState};
use cloudsweep::recorder::ManifestRecorder;
use cloudsweep::source::CommandExporter;
use cloudsweep::scheduler::{EventReceiver, PipelineEvent, RunSummary, UploadScheduler};
use cloudsweep::transport::{TransferContext, TransferOutcome, Transport};
use cloudsweep::utils::StagingArea;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MIB: usize = 1024 * 1024;

fn options(staging: &TempDir) -> ConfigOptions {
    ConfigOptions {
        staging_dir: Some(staging.path().to_path_buf()),
        retry_queue_delay: Some(Duration::from_millis(10)),
        chunk_backoff_unit: Some(Duration::from_millis(1)),
        ..Default::default()
    }
}

fn test_config(base_url: &str, staging: &TempDir) -> Arc<Config> {
    Config::new(base_url.to_string(), "media".to_string(), options(staging)).unwrap()
}

fn credentials() -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::new("test-token"))
}

/// Receive events until the completion event, failing after `limit`
async fn until_complete(events: &mut EventReceiver, limit: Duration) -> Vec<PipelineEvent> {
    let mut received = Vec::new();
    tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, PipelineEvent::AllComplete(_));
            received.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("pipeline did not complete in time");
    received
}

/// Events that arrive within `wait`, without blocking past it
async fn drain_for(events: &mut EventReceiver, wait: Duration) -> Vec<PipelineEvent> {
    tokio::time::sleep(wait).await;
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

fn completions(events: &[PipelineEvent]) -> Vec<RunSummary> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::AllComplete(summary) => Some(*summary),
            _ => None,
        })
        .collect()
}

fn item_results(events: &[PipelineEvent]) -> HashMap<String, bool> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ItemComplete {
                filename, success, ..
            } => Some((filename.clone(), *success)),
            _ => None,
        })
        .collect()
}

fn assert_progress_monotonic(events: &[PipelineEvent]) {
    let mut last: HashMap<&str, f64> = HashMap::new();
    for event in events {
        if let PipelineEvent::Progress { filename, fraction } = event {
            assert!((0.0..=1.0).contains(fraction));
            let previous = last.insert(filename, *fraction).unwrap_or(0.0);
            assert!(
                *fraction >= previous,
                "{} went from {} to {}",
                filename,
                previous,
                fraction
            );
        }
    }
}

/// Confirms every chunk in full
struct AcceptChunks;

impl Respond for AcceptChunks {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset: u64 = request
            .headers
            .get("upload-offset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        ResponseTemplate::new(204)
            .insert_header("upload-offset", (offset + request.body.len() as u64).to_string())
    }
}

#[tokio::test]
async fn test_mixed_direct_and_resumable_run() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path("/object/media/uploads/small.jpg"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/resumable"))
        .respond_with(
            ResponseTemplate::new(201).insert_header("location", "/upload/resumable/s-large"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/resumable/s-large"))
        .respond_with(AcceptChunks)
        .expect(4)
        .mount(&server)
        .await;

    let large = source.path().join("large.mp4");
    std::fs::write(&large, vec![3u8; 20 * MIB]).unwrap();

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .build()
            .unwrap();

    let small = UploadItem::from_bytes(vec![1u8; 2 * MIB], "small.jpg", "image/jpeg");
    assert_eq!(scheduler.enqueue(small), Some(Route::Direct));
    let large = UploadItem::from_file(&large, "large.mp4", "video/mp4");
    assert_eq!(scheduler.enqueue(large), Some(Route::Resumable));

    let received = until_complete(&mut events, Duration::from_secs(30)).await;
    let results = item_results(&received);
    assert_eq!(results.get("small.jpg"), Some(&true));
    assert_eq!(results.get("large.mp4"), Some(&true));
    assert_eq!(
        completions(&received),
        vec![RunSummary {
            succeeded: 2,
            failed: 0
        }]
    );
    assert_progress_monotonic(&received);

    assert_eq!(scheduler.state("small.jpg"), Some(UploadState::Succeeded));
    assert_eq!(scheduler.state("large.mp4"), Some(UploadState::Succeeded));
    assert!(scheduler.states().iter().all(|(_, state)| state.is_terminal()));
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(scheduler.queued_count(), 0);
    assert_eq!(StagingArea::new(staging.path()).artifact_count(), 0);

    assert!(completions(&drain_for(&mut events, Duration::from_millis(100)).await).is_empty());
}

#[tokio::test]
async fn test_direct_transient_failures_exhaust_attempts() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .build()
            .unwrap();
    assert!(scheduler.enqueue_direct_bytes(vec![1u8; 64], "flaky.jpg", "image/jpeg"));

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(item_results(&received).get("flaky.jpg"), Some(&false));
    assert_eq!(
        completions(&received),
        vec![RunSummary {
            succeeded: 0,
            failed: 1
        }]
    );
    assert!(matches!(
        scheduler.state("flaky.jpg"),
        Some(UploadState::Failed(_))
    ));
}

#[tokio::test]
async fn test_terminal_error_is_not_retried() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(413))
        .expect(1)
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .build()
            .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "huge.jpg", "image/jpeg");

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert!(received.contains(&PipelineEvent::ItemComplete {
        filename: "huge.jpg".into(),
        success: false,
        error: Some(UploadError::PayloadTooLarge.to_string()),
    }));
}

#[tokio::test]
async fn test_duplicate_key_is_suppressed() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path_regex("^/object/media/uploads/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .build()
            .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "same.jpg", "image/jpeg");
    scheduler.enqueue_direct_bytes(vec![2u8; 64], "same.jpg", "image/jpeg");
    assert_eq!(scheduler.active_count(), 1);

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(
        completions(&received),
        vec![RunSummary {
            succeeded: 1,
            failed: 0
        }]
    );
}

#[tokio::test]
async fn test_missing_credential_fails_without_requests() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    let (scheduler, mut events) = UploadScheduler::builder(
        test_config(&server.uri(), &staging),
        Arc::new(StaticCredentials::anonymous()),
    )
    .build()
    .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "a.jpg", "image/jpeg");

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert!(received.contains(&PipelineEvent::ItemComplete {
        filename: "a.jpg".into(),
        success: false,
        error: Some(UploadError::NotAuthenticated.to_string()),
    }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_all_abandons_run() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .build()
            .unwrap();
    for i in 0..5 {
        scheduler.enqueue_direct_bytes(vec![1u8; 1024], format!("item-{}.jpg", i), "image/jpeg");
    }
    assert_eq!(scheduler.active_count(), 2);
    assert_eq!(scheduler.queued_count(), 3);

    // Wait until both transfers have reached the server
    tokio::time::timeout(Duration::from_secs(10), async {
        while server.received_requests().await.unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    scheduler.cancel_all().await;

    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(scheduler.queued_count(), 0);
    assert_eq!(StagingArea::new(staging.path()).artifact_count(), 0);
    for (_, state) in scheduler.states() {
        assert_eq!(state, UploadState::Cancelled);
    }

    let later = drain_for(&mut events, Duration::from_millis(200)).await;
    assert!(completions(&later).is_empty());
    assert!(item_results(&later).is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // Ignored until the next run starts
    assert!(!scheduler.enqueue_direct_bytes(vec![1u8; 8], "late.jpg", "image/jpeg"));
    assert_eq!(scheduler.queued_count(), 0);
}

/// Counts refreshes and hands out a new token afterwards
#[derive(Default)]
struct CountingCredentials {
    refreshes: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    async fn current_token(&self) -> Option<String> {
        Some(format!("token-{}", self.refreshes.load(Ordering::SeqCst)))
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_and_retried() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(wiremock::matchers::header("authorization", "Bearer token-0"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(wiremock::matchers::header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let credentials = Arc::new(CountingCredentials::default());
    let mut options = options(&staging);
    options.retry_queue_delay = Some(Duration::from_millis(200));
    let config = Config::new(server.uri(), "media".into(), options).unwrap();

    let (scheduler, mut events) = UploadScheduler::builder(config, credentials.clone())
        .build()
        .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "a.jpg", "image/jpeg");

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(item_results(&received).get("a.jpg"), Some(&true));
    assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_successful_uploads_are_recorded() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let manifest = output.path().join("manifest").join("uploads.jsonl");

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .recorder(Arc::new(ManifestRecorder::new(&manifest)))
            .build()
            .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "Été.jpg", "image/jpeg");

    until_complete(&mut events, Duration::from_secs(10)).await;

    let records = ManifestRecorder::load(&manifest).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].filename, "Été.jpg");
    assert_eq!(records[0].object_path, "uploads/Ete.jpg");
    assert_eq!(records[0].bucket, "media");
    assert_eq!(records[0].size, Some(64));
}

#[tokio::test]
async fn test_retried_item_keeps_its_object_key() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let manifest = output.path().join("uploads.jsonl");

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (scheduler, mut events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .recorder(Arc::new(ManifestRecorder::new(&manifest)))
            .build()
            .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 64], "日本.jpg", "image/jpeg");

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(item_results(&received).get("日本.jpg"), Some(&true));

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0], paths[1]);

    let records = ManifestRecorder::load(&manifest).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].object_path.ends_with(".jpg"));
    assert_eq!(paths[0], format!("/object/media/{}", records[0].object_path));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_during_export_removes_output() {
    let server = MockServer::start().await;
    let staging = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();

    let input = source.path().join("clip.mov");
    std::fs::write(&input, vec![7u8; 1024]).unwrap();
    let script = source.path().join("export.sh");
    std::fs::write(&script, "cp \"$1\" \"$2\"\nsleep 30\n").unwrap();

    let exporter = CommandExporter::parse(
        &format!("sh {} {{input}} {{output}}", script.display()),
        "mp4",
    )
    .unwrap();
    let (scheduler, _events) =
        UploadScheduler::builder(test_config(&server.uri(), &staging), credentials())
            .exporter(Arc::new(exporter))
            .build()
            .unwrap();
    assert!(scheduler.enqueue_resumable(ExportHandle::from_path(&input), "clip.mp4", "video/mp4"));

    // Wait until the export wrote its output and is sleeping
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let written = std::fs::read_dir(staging.path())
                .into_iter()
                .flatten()
                .flatten()
                .any(|e| e.metadata().map(|m| m.len() > 0).unwrap_or(false));
            if written {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("export did not write its output");
    assert_eq!(scheduler.exports_in_progress(), 1);

    scheduler.cancel_all().await;

    assert_eq!(StagingArea::new(staging.path()).artifact_count(), 0);
    assert_eq!(scheduler.exports_in_progress(), 0);
    assert_eq!(scheduler.state("clip.mp4"), Some(UploadState::Cancelled));
    assert!(server.received_requests().await.unwrap().is_empty());
}

/// Concurrent sends across both fake transports
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Transport that sleeps instead of doing I/O and plays back scripted outcomes
struct FakeTransport {
    route: Route,
    delay: Duration,
    gauge: Arc<Gauge>,
    calls: AtomicUsize,
    starts: Mutex<Vec<tokio::time::Instant>>,
    script: Mutex<VecDeque<TransferOutcome>>,
}

impl FakeTransport {
    /// A direct and a resumable transport sharing one gauge
    fn pair(delay: Duration) -> (Arc<Self>, Arc<Self>, Arc<Gauge>) {
        let gauge = Arc::new(Gauge::default());
        let make = |route| {
            Arc::new(Self {
                route,
                delay,
                gauge: gauge.clone(),
                calls: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
            })
        };
        (make(Route::Direct), make(Route::Resumable), gauge.clone())
    }

    fn then(&self, outcome: TransferOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn route(&self) -> Route {
        self.route
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    async fn send(
        &self,
        _item: &UploadItem,
        _token: &str,
        ctx: &TransferContext,
    ) -> TransferOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(tokio::time::Instant::now());
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        ctx.progress(0, 10);
        let outcome = tokio::select! {
            _ = ctx.cancelled() => TransferOutcome::Cancelled,
            _ = tokio::time::sleep(self.delay) => {
                let outcome = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(TransferOutcome::Success);
                match outcome {
                    TransferOutcome::Success => ctx.progress(10, 10),
                    _ => ctx.progress(5, 10),
                }
                outcome
            }
        };

        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn fake_scheduler(
    staging: &TempDir,
    direct: Arc<FakeTransport>,
    resumable: Arc<FakeTransport>,
) -> (UploadScheduler, EventReceiver) {
    UploadScheduler::builder(test_config("https://store.example.com", staging), credentials())
        .direct_transport(direct)
        .resumable_transport(resumable)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_concurrency_is_bounded_across_transports() {
    let staging = TempDir::new().unwrap();
    let (direct, resumable, gauge) = FakeTransport::pair(Duration::from_millis(50));
    let (scheduler, mut events) = fake_scheduler(&staging, direct.clone(), resumable.clone());

    for i in 0..4 {
        scheduler.enqueue_direct_bytes(vec![1u8; 8], format!("photo-{}.jpg", i), "image/jpeg");
        scheduler.enqueue_resumable(
            ExportHandle::new(format!("vid-{}", i)),
            format!("video-{}.mp4", i),
            "video/mp4",
        );
    }
    assert_eq!(scheduler.active_count(), 2);

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(
        completions(&received),
        vec![RunSummary {
            succeeded: 8,
            failed: 0
        }]
    );
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(direct.calls.load(Ordering::SeqCst), 4);
    assert_eq!(resumable.calls.load(Ordering::SeqCst), 4);
    assert_progress_monotonic(&received);
}

#[tokio::test]
async fn test_retry_keeps_progress_monotonic() {
    let staging = TempDir::new().unwrap();
    let (direct, resumable, _) = FakeTransport::pair(Duration::from_millis(5));
    direct.then(TransferOutcome::Retryable(UploadError::Network("reset".into())));

    let (scheduler, mut events) = fake_scheduler(&staging, direct.clone(), resumable);
    scheduler.enqueue_direct_bytes(vec![1u8; 8], "a.jpg", "image/jpeg");

    let received = until_complete(&mut events, Duration::from_secs(10)).await;
    let fractions: Vec<f64> = received
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        })
        .collect();

    assert_eq!(fractions, vec![0.0, 0.5, 1.0]);
    assert_eq!(direct.calls.load(Ordering::SeqCst), 2);
    assert_eq!(item_results(&received).get("a.jpg"), Some(&true));
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_queue_delay() {
    let staging = TempDir::new().unwrap();
    let (direct, resumable, _) = FakeTransport::pair(Duration::from_millis(5));
    direct.then(TransferOutcome::Retryable(UploadError::Network("reset".into())));

    let retry_delay = Duration::from_secs(2);
    let config = Config::new(
        "https://store.example.com".to_string(),
        "media".to_string(),
        ConfigOptions {
            retry_queue_delay: Some(retry_delay),
            ..options(&staging)
        },
    )
    .unwrap();
    let (scheduler, mut events) = UploadScheduler::builder(config, credentials())
        .direct_transport(direct.clone())
        .resumable_transport(resumable)
        .build()
        .unwrap();
    scheduler.enqueue_direct_bytes(vec![1u8; 8], "a.jpg", "image/jpeg");

    until_complete(&mut events, Duration::from_secs(10)).await;

    let starts = direct.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 2);
    let gap = starts[1] - starts[0];
    assert!(
        gap >= retry_delay + Duration::from_millis(5),
        "retry started after {:?}",
        gap
    );
}

#[tokio::test]
async fn test_routing_by_kind_and_size() {
    let staging = TempDir::new().unwrap();
    let (direct, resumable, _) = FakeTransport::pair(Duration::from_millis(1));
    let (scheduler, mut events) = fake_scheduler(&staging, direct.clone(), resumable.clone());

    let threshold = scheduler.config().resumable_threshold as usize;
    let small = UploadItem::from_bytes(vec![0u8; threshold - 1], "small.jpg", "image/jpeg");
    let large = UploadItem::from_bytes(vec![0u8; threshold], "large.jpg", "image/jpeg");
    let deferred = UploadItem::deferred(ExportHandle::new("v"), "clip.mp4", "video/mp4");

    assert_eq!(scheduler.route_for(&small), Route::Direct);
    assert_eq!(scheduler.route_for(&large), Route::Resumable);
    assert_eq!(scheduler.route_for(&deferred), Route::Resumable);

    scheduler.enqueue(small);
    scheduler.enqueue(large);
    scheduler.enqueue(deferred);
    until_complete(&mut events, Duration::from_secs(10)).await;

    assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
    assert_eq!(resumable.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset_state_starts_new_run() {
    let staging = TempDir::new().unwrap();
    let (direct, resumable, _) = FakeTransport::pair(Duration::from_millis(5));
    let (scheduler, mut events) = fake_scheduler(&staging, direct, resumable);

    scheduler.enqueue_direct_bytes(vec![1u8; 8], "a.jpg", "image/jpeg");
    let first = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(completions(&first).len(), 1);

    scheduler.cancel_all().await;
    assert!(!scheduler.enqueue_direct_bytes(vec![1u8; 8], "b.jpg", "image/jpeg"));

    scheduler.reset_state();
    assert_eq!(scheduler.summary(), RunSummary::default());
    assert!(scheduler.states().is_empty());

    assert!(scheduler.enqueue_direct_bytes(vec![1u8; 8], "b.jpg", "image/jpeg"));
    let second = until_complete(&mut events, Duration::from_secs(10)).await;
    assert_eq!(
        completions(&second),
        vec![RunSummary {
            succeeded: 1,
            failed: 0
        }]
    );
}
