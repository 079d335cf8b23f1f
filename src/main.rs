//! cloudsweep - back up a directory of photos and videos to object storage

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use cloudsweep::config::{Config, ConfigOptions};
use cloudsweep::credentials::StaticCredentials;
use cloudsweep::item::{ExportHandle, UploadItem};
use cloudsweep::recorder::ManifestRecorder;
use cloudsweep::scheduler::{PipelineEvent, RunSummary, UploadScheduler};
use cloudsweep::source::CommandExporter;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walkdir::WalkDir;

const DEFAULT_INCLUDE: &[&str] = &[
    "*.jpg", "*.jpeg", "*.png", "*.gif", "*.heic", "*.heif", "*.webp", "*.mp4", "*.mov", "*.m4v",
];

#[derive(Parser, Debug)]
#[command(name = "cloudsweep")]
#[command(about = "Back up a directory of photos and videos to object storage")]
struct Args {
    /// Directory to scan for media files
    source_dir: PathBuf,

    /// Storage API base URL
    #[arg(long)]
    base_url: String,

    /// Bearer token
    #[arg(long)]
    token: String,

    /// Environment variable re-read when the token expires
    #[arg(long)]
    refresh_env: Option<String>,

    /// Destination bucket
    #[arg(long)]
    bucket: String,

    /// Folder prefix inside the bucket
    #[arg(long)]
    folder: Option<String>,

    /// Concurrent uploads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Resumable chunk size in MiB
    #[arg(long)]
    chunk_size_mib: Option<usize>,

    /// Files at least this large (MiB) use the resumable transport
    #[arg(long)]
    threshold_mib: Option<u64>,

    /// Directory for transfer-local copies and exports
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Glob of files to upload (repeatable); defaults to common photo/video types
    #[arg(long = "include")]
    include: Vec<String>,

    /// Append a JSON line per uploaded object to this file
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Export command run before upload, e.g. "ffmpeg -y -i {input} {output}"
    #[arg(long)]
    export_cmd: Option<String>,

    /// Files matching this glob go through the export command
    #[arg(long)]
    export_glob: Option<String>,

    /// Extension of exported files
    #[arg(long, default_value = "mp4")]
    export_ext: String,

    /// Delete local files once their upload succeeded
    #[arg(long)]
    delete_uploaded: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let options = ConfigOptions {
        folder_prefix: args.folder.clone(),
        max_concurrency: args.concurrency,
        chunk_size: args.chunk_size_mib.map(|m| m * 1024 * 1024),
        resumable_threshold: args.threshold_mib.map(|m| m * 1024 * 1024),
        staging_dir: args.staging_dir.clone(),
        ..Default::default()
    };
    let config = Config::new(args.base_url.clone(), args.bucket.clone(), options)?;

    let mut credentials = StaticCredentials::new(args.token.clone());
    if let Some(var) = &args.refresh_env {
        credentials = credentials.with_refresh_env(var.clone());
    }

    let mut builder = UploadScheduler::builder(config, Arc::new(credentials));
    if let Some(path) = &args.manifest {
        builder = builder.recorder(Arc::new(ManifestRecorder::new(path.clone())));
    }

    let export_matcher = match (&args.export_cmd, &args.export_glob) {
        (Some(cmd), Some(glob)) => {
            builder = builder.exporter(Arc::new(CommandExporter::parse(cmd, &args.export_ext)?));
            Some(build_globset(&[glob.clone()])?)
        }
        (Some(_), None) => return Err(anyhow!("--export-cmd requires --export-glob")),
        (None, _) => None,
    };

    let (scheduler, mut events) = builder.build()?;

    let patterns = if args.include.is_empty() {
        DEFAULT_INCLUDE.iter().map(|p| p.to_string()).collect()
    } else {
        args.include.clone()
    };
    let files = discover(&args.source_dir, &build_globset(&patterns)?)?;
    if files.is_empty() {
        info!("No media files found in {}", args.source_dir.display());
        return Ok(());
    }

    info!("Found {} file(s) in {}", files.len(), args.source_dir.display());

    let mut local_paths: HashMap<String, PathBuf> = HashMap::new();
    for (relative, path, size) in files {
        let name = item_name(&relative);
        let deferred = export_matcher
            .as_ref()
            .map(|m| m.is_match(&relative))
            .unwrap_or(false);

        let item = if deferred {
            let name = exported_name(&name, &args.export_ext);
            let content_type = mime_guess::from_ext(&args.export_ext)
                .first_or_octet_stream()
                .to_string();
            UploadItem::deferred(ExportHandle::from_path(&path), name, content_type)
        } else {
            let content_type = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string();
            let item = UploadItem::from_file(&path, name, content_type);
            match size {
                Some(size) => item.with_size(size),
                None => item,
            }
        };

        let key = item.key().to_string();
        if local_paths.insert(key.clone(), path).is_some() {
            warn!("{} maps to an item name already in this run", key);
        }
        if let Some(route) = scheduler.enqueue(item) {
            debug!("{} -> {}", key, route);
        }
    }

    let mut uploaded = Vec::new();
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let summary = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PipelineEvent::Progress { filename, fraction }) => {
                    debug!("{}: {:.0}%", filename, fraction * 100.0);
                }
                Some(PipelineEvent::ItemComplete { filename, success, error }) => {
                    if success {
                        info!("Uploaded {}", filename);
                        uploaded.push(filename);
                    } else {
                        error!("Failed {}: {}", filename, error.unwrap_or_default());
                    }
                }
                Some(PipelineEvent::AllComplete(summary)) => break summary,
                None => break scheduler.summary(),
            },
            _ = &mut ctrl_c => {
                warn!("Interrupted, cancelling uploads");
                interrupted = true;
                scheduler.cancel_all().await;
                break scheduler.summary();
            }
        }
    };

    let deletion_failures = if args.delete_uploaded && !interrupted {
        delete_uploaded(&uploaded, &local_paths).await
    } else {
        0
    };

    report(&summary, deletion_failures, interrupted);

    if interrupted || summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

/// Regular files under `root` matching `matcher`, as (relative path, path, size)
fn discover(root: &Path, matcher: &GlobSet) -> Result<Vec<(String, PathBuf, Option<u64>)>> {
    if !root.is_dir() {
        return Err(anyhow!("{} is not a directory", root.display()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if matcher.is_match(&relative) {
            let size = entry.metadata().ok().map(|m| m.len());
            files.push((relative, entry.into_path(), size));
        }
    }
    Ok(files)
}

/// Flatten a relative path into an item name unique within the run
fn item_name(relative: &str) -> String {
    relative.replace('/', "_")
}

fn exported_name(name: &str, extension: &str) -> String {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    format!("{}.{}", stem, extension.trim_start_matches('.'))
}

async fn delete_uploaded(uploaded: &[String], local_paths: &HashMap<String, PathBuf>) -> usize {
    let mut failures = 0;
    for name in uploaded {
        let Some(path) = local_paths.get(name) else {
            continue;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(e) => {
                warn!("Could not delete {}: {}", path.display(), e);
                failures += 1;
            }
        }
    }
    failures
}

fn report(summary: &RunSummary, deletion_failures: usize, interrupted: bool) {
    if interrupted {
        warn!(
            "Run cancelled after {} uploaded, {} failed",
            summary.succeeded, summary.failed
        );
        return;
    }

    info!(
        "Done: {} uploaded, {} failed of {}",
        summary.succeeded,
        summary.failed,
        summary.total()
    );
    if deletion_failures > 0 {
        warn!("{} local file(s) could not be deleted", deletion_failures);
    }
}
