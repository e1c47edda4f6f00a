//! Byte-range session: probe, plan chunks, fetch them in parallel.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{DownloadConfig, DownloadSession, SessionContext, join_helpers, start_reporter};
use crate::download::checkpoint::ResumeCheckpoint;
use crate::download::error::DownloadError;
use crate::download::metadata::SessionMetadata;
use crate::download::plan::ChunkPlan;
use crate::download::pool::{ChunkFetcher, WorkerPool, WriterWindow, spawn_watchdog};
use crate::download::probe::probe;
use crate::download::reassembly::{ByteOffset, ReassemblyWriter};
use crate::download::state::SessionGate;
use crate::download::status::DownloadStatus;
use crate::download::target::DownloadTarget;

pub(super) async fn run(
    session: &DownloadSession,
    ctx: &SessionContext,
    config: &DownloadConfig,
    gate: &SessionGate,
) -> Result<DownloadStatus, DownloadError> {
    let existing = if session.resume {
        ctx.sink.length(&session.output).await?
    } else {
        0
    };
    let checkpoint = if session.resume {
        session.load_checkpoint(ctx).await
    } else {
        None
    };

    let probed = match probe(ctx.http.as_ref(), &session.request).await {
        Ok(probed) => probed,
        Err(error) => {
            warn!(%error, "probe failed");
            gate.fail();
            return Ok(DownloadStatus::Failed);
        }
    };
    let target = Arc::new(DownloadTarget::from_probe(&session.request, probed));
    info!(
        total = ?target.total_length,
        supports_ranges = target.supports_ranges,
        existing,
        "probed source"
    );

    let minimum = session.minimum_size(config);
    if let Some(total) = target.total_length.filter(|total| *total < minimum) {
        return Ok(session.reject_undersized(ctx, gate, total, minimum).await);
    }

    let mut start_offset = existing;
    let stale_estimate = checkpoint
        .and_then(|c| c.total_bytes_estimate)
        .filter(|estimate| Some(*estimate) != target.total_length);
    if let Some(estimate) = stale_estimate {
        info!(
            estimate,
            total = ?target.total_length,
            "source size changed since the checkpoint, restarting"
        );
        start_offset = 0;
    }

    let plan = match ChunkPlan::plan(
        target.total_length,
        target.supports_ranges,
        start_offset,
        config.chunk_size,
        config.small_file_threshold,
    ) {
        Ok(plan) => Arc::new(plan),
        Err(error) => {
            warn!(%error, "cannot plan chunks");
            return Ok(DownloadStatus::BadConfig);
        }
    };
    if !plan.is_resumed() && existing > 0 {
        info!(existing, "discarding partial output");
    }

    let writer = match ctx.sink.open(&session.output, plan.is_resumed()).await {
        Ok(writer) => writer,
        Err(error) => {
            warn!(%error, path = %session.output.display(), "output is not writable");
            return Ok(DownloadStatus::BadConfig);
        }
    };

    let metadata = Arc::new(SessionMetadata::new());
    metadata.set_total_bytes(target.total_length);
    if plan.is_resumed() {
        metadata.seed_resumed(plan.start_offset());
    }
    debug!(
        chunks = plan.len(),
        start = plan.start_offset(),
        length = ?plan.download_length(),
        "planned chunks"
    );

    let writer = Arc::new(ReassemblyWriter::new(
        ByteOffset(plan.start_offset()),
        writer,
        gate.clone(),
        Arc::clone(&metadata),
    ));
    let reporter_task = start_reporter(session, ctx, config, gate, &metadata, false);
    let watchdog = spawn_watchdog(
        Arc::clone(&ctx.sink),
        session.output.clone(),
        gate.clone(),
        config.watchdog_interval,
    );

    let fetcher = ChunkFetcher::new(
        Arc::clone(&ctx.http),
        Arc::clone(&target),
        Arc::clone(&plan),
        Arc::clone(&writer),
        Arc::clone(&metadata),
        config.retry.clone(),
        config.buffer_size,
    );
    let window_plan = Arc::clone(&plan);
    let window = WriterWindow::new(writer.progress(), move |key: ByteOffset| {
        window_plan.index_of(key.0)
    });
    let pool = WorkerPool::new(config.connections, gate.clone()).with_window(Arc::new(window));
    let pooled = pool
        .run(0..plan.len(), move |index| {
            let fetcher = fetcher.clone();
            async move { fetcher.fetch(index).await }
        })
        .await;
    let flushed = match pooled {
        Ok(_) => writer.finish().await.map(|_| ()),
        Err(error) => Err(error),
    };

    let checkpoint = ResumeCheckpoint {
        bytes_written: metadata.bytes_written(),
        next_segment_index: None,
        total_bytes_estimate: target.total_length,
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
    Ok(status)
}
