//! CLI entry point for streamdl.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use streamdl_core::download::constants::{CONNECT_TIMEOUT_SECS, MIB, READ_TIMEOUT_SECS};
use streamdl_core::download::{CheckpointStore, NoopProgressSink, ProgressSink};
use streamdl_core::{
    Database, DownloadConfig, DownloadJob, DownloadManager, DownloadRequest, DownloadStatus,
    FsSink, HttpClient, LinkKind, MemoryCheckpointStore, RetryPolicy, SqliteCheckpointStore,
};
use tracing::{debug, info, warn};
use url::Url;

mod app_config;
mod cli;
mod progress_display;

use app_config::{FileConfig, load_default_file_config};
use cli::Args;
use progress_display::{BarProgressSink, JsonProgressSink};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let file_config = load_default_file_config()?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config verbosity > info
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => file_config.verbosity.map_or("info", |v| v.filter()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, ?file_config, "CLI arguments parsed");

    let config = download_config(&args, &file_config);
    let connect_timeout = file_config
        .connect_timeout_secs
        .unwrap_or(CONNECT_TIMEOUT_SECS);
    let read_timeout = file_config.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS);
    let http = HttpClient::with_timeouts(connect_timeout, read_timeout)
        .context("Failed to build HTTP client")?;

    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| file_config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let sink = FsSink::new(&output_dir);

    let checkpoints: Arc<dyn CheckpointStore> =
        match args.db.as_ref().or(file_config.checkpoint_db.as_ref()) {
            Some(path) => {
                let db = Database::new(path).await.with_context(|| {
                    format!("Failed to open checkpoint database '{}'", path.display())
                })?;
                Arc::new(SqliteCheckpointStore::new(db))
            }
            None => Arc::new(MemoryCheckpointStore::new()),
        };

    let progress: Arc<dyn ProgressSink> = if args.json_progress {
        Arc::new(JsonProgressSink)
    } else if args.quiet {
        Arc::new(NoopProgressSink)
    } else {
        Arc::new(BarProgressSink::new())
    };

    let mirrors = mirror_requests(&args);
    let name = args.name.clone().unwrap_or_else(|| {
        mirrors
            .first()
            .map_or_else(|| "download".to_string(), output_name)
    });
    let id = args.id.clone().unwrap_or_else(|| name.clone());

    let manager = DownloadManager::new(
        config,
        Arc::new(http),
        Arc::new(sink),
        checkpoints,
        progress,
    )?;
    let job = download_job(&args, id, mirrors, &name);

    info!(output = %output_dir.join(&name).display(), "starting download");
    let handle = manager.start(job)?;

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping download");
            stopper.stop();
        }
    });

    let status = handle.wait().await;
    info!(%status, "download finished");

    Ok(match status {
        DownloadStatus::Success => ExitCode::SUCCESS,
        DownloadStatus::Stopped => ExitCode::from(130),
        DownloadStatus::Failed | DownloadStatus::InvalidInput | DownloadStatus::BadConfig => {
            ExitCode::FAILURE
        }
    })
}

/// Library configuration from defaults, the config file and CLI flags (highest priority).
fn download_config(args: &Args, file: &FileConfig) -> DownloadConfig {
    let mut config = DownloadConfig::default();
    if let Some(chunk_mib) = file.chunk_size_mib {
        config = config.with_chunk_size(chunk_mib * MIB);
    }
    if let Some(connections) = args.connections.or(file.connections) {
        config.connections = usize::from(connections);
    }
    if let Some(max) = file.max_concurrent_downloads {
        config.max_concurrent_downloads = usize::from(max);
    }
    if let Some(retries) = args.max_retries.or(file.max_retries) {
        config.retry = RetryPolicy::with_max_attempts(u32::from(retries));
    }
    if let Some(interval_ms) = file.progress_interval_ms {
        config.progress_interval = Duration::from_millis(interval_ms);
    }
    config
}

/// The job for this invocation; `--min-size` applies to this job only.
fn download_job(
    args: &Args,
    id: String,
    mirrors: Vec<DownloadRequest>,
    name: &str,
) -> DownloadJob {
    let job = DownloadJob::new(id, mirrors, name).with_resume(args.resume);
    match args.min_size {
        Some(minimum) => job.with_minimum_size(minimum),
        None => job,
    }
}

fn mirror_requests(args: &Args) -> Vec<DownloadRequest> {
    args.urls
        .iter()
        .map(|url| {
            let mut request = DownloadRequest::new(url.as_str());
            if args.hls {
                request = request.with_kind(LinkKind::Hls);
            }
            if let Some(referer) = &args.referer {
                request = request.with_referer(referer.as_str());
            }
            for (name, value) in &args.headers {
                request = request.with_header(name.as_str(), value.as_str());
            }
            request
        })
        .collect()
}

/// Last URL path segment, with HLS playlists saved as `.ts`.
fn output_name(request: &DownloadRequest) -> String {
    let segment = Url::parse(&request.url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "download".to_string());

    if request.kind == LinkKind::Hls {
        let stem = segment
            .strip_suffix(".m3u8")
            .or_else(|| segment.strip_suffix(".M3U8"))
            .unwrap_or(&segment);
        return format!("{stem}.ts");
    }
    segment
}
