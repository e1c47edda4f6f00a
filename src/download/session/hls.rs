//! HLS session: resolve the playlist, fetch segments in parallel, checkpoint
//! after every flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DownloadConfig, DownloadSession, SessionContext, join_helpers, start_reporter};
use crate::download::checkpoint::{CheckpointStore, ResumeCheckpoint};
use crate::download::error::DownloadError;
use crate::download::hls::{HlsMedia, HlsResolver};
use crate::download::metadata::SessionMetadata;
use crate::download::pool::{WorkerPool, WriterWindow, spawn_watchdog};
use crate::download::reassembly::{FetchResult, FlushObserver, ReassemblyWriter, SegmentIndex};
use crate::download::state::SessionGate;
use crate::download::status::DownloadStatus;

/// Stores a checkpoint each time the contiguous prefix grows.
struct SegmentCheckpointer {
    id: String,
    mirror_index: usize,
    store: Arc<dyn CheckpointStore>,
    metadata: Arc<SessionMetadata>,
}

#[async_trait]
impl FlushObserver<SegmentIndex> for SegmentCheckpointer {
    async fn on_flush(&self, next_key: SegmentIndex, bytes_written: u64) {
        let checkpoint = ResumeCheckpoint {
            bytes_written,
            next_segment_index: Some(next_key.0),
            total_bytes_estimate: self.metadata.approx_total_bytes(),
            mirror_index: self.mirror_index,
        };
        if let Err(error) = self.store.put(&self.id, &checkpoint).await {
            warn!(%error, next = next_key.0, "could not store segment checkpoint");
        }
    }
}

pub(super) async fn run(
    session: &DownloadSession,
    ctx: &SessionContext,
    config: &DownloadConfig,
    gate: &SessionGate,
) -> Result<DownloadStatus, DownloadError> {
    let resolver = HlsResolver::new(Arc::clone(&ctx.http))
        .with_preference(config.variant)
        .with_retry_policy(config.segment_retry.clone());

    let media = match resolver.resolve(&session.request).await {
        Ok(media) => Arc::new(media),
        Err(error) => {
            let status = if is_unusable_source(&error) {
                DownloadStatus::InvalidInput
            } else {
                DownloadStatus::Failed
            };
            warn!(%error, %status, "could not resolve playlist");
            gate.fail();
            return Ok(status);
        }
    };

    let (start_index, resumed_bytes) = resume_point(session, ctx, &media).await?;

    let writer = match ctx.sink.open(&session.output, start_index > 0).await {
        Ok(writer) => writer,
        Err(error) => {
            warn!(%error, path = %session.output.display(), "output is not writable");
            return Ok(DownloadStatus::BadConfig);
        }
    };

    let metadata = Arc::new(SessionMetadata::new());
    metadata.set_segment_total(media.len());
    metadata.seed_resumed(resumed_bytes);
    metadata.seed_resumed_segments(start_index);
    info!(
        segments = media.len(),
        start_index,
        playlist = %media.playlist_url,
        "resolved HLS media"
    );

    let observer = Arc::new(SegmentCheckpointer {
        id: session.id.clone(),
        mirror_index: session.mirror_index,
        store: Arc::clone(&ctx.checkpoints),
        metadata: Arc::clone(&metadata),
    });
    let writer = Arc::new(
        ReassemblyWriter::new(
            SegmentIndex(start_index),
            writer,
            gate.clone(),
            Arc::clone(&metadata),
        )
        .with_observer(observer),
    );
    let reporter_task = start_reporter(session, ctx, config, gate, &metadata, true);
    let watchdog = spawn_watchdog(
        Arc::clone(&ctx.sink),
        session.output.clone(),
        gate.clone(),
        config.watchdog_interval,
    );

    let request = Arc::new(session.request.clone());
    let fetch_media = Arc::clone(&media);
    let fetch_writer = Arc::clone(&writer);
    let fetch_metadata = Arc::clone(&metadata);
    let unusable = Arc::new(AtomicBool::new(false));
    let fetch_unusable = Arc::clone(&unusable);
    let window = WriterWindow::new(writer.progress(), |key: SegmentIndex| key.0);
    let pool = WorkerPool::new(config.connections, gate.clone()).with_window(Arc::new(window));
    let pooled = pool
        .run(start_index..media.len(), move |index| {
            let resolver = resolver.clone();
            let request = Arc::clone(&request);
            let media = Arc::clone(&fetch_media);
            let writer = Arc::clone(&fetch_writer);
            let metadata = Arc::clone(&fetch_metadata);
            let unusable = Arc::clone(&fetch_unusable);
            async move {
                let segment = &media.segments[index];
                let payload = match resolver.fetch_segment(&request, segment).await {
                    Ok(payload) => payload,
                    Err(error) => {
                        if is_unusable_source(&error) {
                            unusable.store(true, Ordering::SeqCst);
                        }
                        return Err(error);
                    }
                };
                metadata.add_downloaded(payload.len() as u64);
                metadata.add_segment_downloaded();
                let outcome = writer
                    .on_result(FetchResult::new(SegmentIndex(index), payload))
                    .await?;
                debug!(index, ?outcome, "segment delivered");
                Ok(())
            }
        })
        .await;
    let flushed = match pooled {
        Ok(_) => writer.finish().await.map(|_| ()),
        Err(error) => Err(error),
    };

    let checkpoint = ResumeCheckpoint {
        bytes_written: metadata.bytes_written(),
        next_segment_index: Some(writer.next_key().await.0),
        total_bytes_estimate: metadata.approx_total_bytes(),
        mirror_index: session.mirror_index,
    };

    if let Err(error) = flushed {
        warn!(%error, "writing output failed");
        gate.fail();
        session.store_checkpoint(ctx, &checkpoint).await;
        join_helpers([watchdog, reporter_task]).await;
        return Err(error);
    }

    let status = session
        .settle(ctx, config, gate, &metadata, checkpoint)
        .await;
    join_helpers([watchdog, reporter_task]).await;
    if status == DownloadStatus::Failed && unusable.load(Ordering::SeqCst) {
        warn!("segments from this source cannot be decrypted");
        return Ok(DownloadStatus::InvalidInput);
    }
    Ok(status)
}

/// First segment to fetch and the bytes already on disk before it.
///
/// The checkpoint is only trusted when the partial file still has exactly
/// the length it recorded.
async fn resume_point(
    session: &DownloadSession,
    ctx: &SessionContext,
    media: &HlsMedia,
) -> Result<(usize, u64), DownloadError> {
    if !session.resume {
        return Ok((0, 0));
    }
    let Some(checkpoint) = session.load_checkpoint(ctx).await else {
        return Ok((0, 0));
    };
    let Some(index) = checkpoint.next_segment_index else {
        return Ok((0, 0));
    };

    let on_disk = ctx.sink.length(&session.output).await?;
    if on_disk != checkpoint.bytes_written || index > media.len() {
        info!(
            on_disk,
            recorded = checkpoint.bytes_written,
            index,
            "checkpoint does not match partial output, restarting"
        );
        return Ok((0, 0));
    }
    debug!(index, bytes = on_disk, "resuming HLS download");
    Ok((index, on_disk))
}

fn is_unusable_source(error: &DownloadError) -> bool {
    matches!(
        error,
        DownloadError::Playlist { .. }
            | DownloadError::UnsupportedLink { .. }
            | DownloadError::InvalidUrl { .. }
            | DownloadError::Decryption { .. }
    )
}
