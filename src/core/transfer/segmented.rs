use crate::core::control::RunState;
use crate::core::error::{FailureKind, TransferOutcome};
use crate::core::model::{DownloadLink, DownloadStatus, DownloadedFileInfo};
use crate::core::progress::spawn_ticker;
use crate::core::sink::{OutputTarget, SinkWriter};
use crate::core::transfer::TransferContext;
use crate::plugins::registry::SegmentSource;
use futures::StreamExt;

/// Size estimate from the segments seen so far. Assumes segments are of
/// roughly equal size, so uneven playlists (ad breaks, intros) skew it.
pub fn estimate_total(bytes_done: u64, segments_done: usize, total_segments: usize) -> u64 {
    if segments_done == 0 {
        return bytes_done;
    }
    (bytes_done as u128 * total_segments as u128 / segments_done as u128) as u64
}

/// The persisted segment index is only valid if every byte it counts is
/// already on disk.
async fn append_durably(writer: &mut SinkWriter, bytes: &[u8]) -> std::io::Result<()> {
    writer.append(bytes).await?;
    writer.flush().await
}

/// Appends a playlist's segments, in order, into one output file.
pub struct SegmentedTransfer<'a> {
    pub link: &'a DownloadLink,
    pub target: &'a OutputTarget,
    pub resume: bool,
}

impl<'a> SegmentedTransfer<'a> {
    /// Segment index to continue from: the persisted count of completed
    /// segments, provided the partial file is still there.
    async fn start_index(&self, ctx: &TransferContext) -> usize {
        if !self.resume {
            return 0;
        }
        let persisted = match ctx.records.file_info(ctx.item_id).await {
            Ok(info) => info.and_then(|i| i.segment_index()).unwrap_or(0),
            Err(e) => {
                tracing::warn!(item_id = ctx.item_id, "read file info: {:#}", e);
                0
            }
        };
        match self.target.existing_len().await {
            Some(len) if len > 0 => persisted,
            _ => 0,
        }
    }

    pub async fn run(&self, ctx: &TransferContext, source: &dyn SegmentSource) -> TransferOutcome {
        let item_id = ctx.item_id;
        let start = self.start_index(ctx).await;

        let opened = match self.target.open(start > 0).await {
            Ok(o) => o,
            Err(kind) => {
                tracing::warn!(item_id, path = %self.target.path().display(), "open output: {}", kind);
                return TransferOutcome::Failed(kind);
            }
        };
        let mut writer = opened.writer;

        let tracker = ctx.tracker.clone();
        tracker.reset(opened.existing_len, 0);
        let mut gate = ctx.gate.clone();

        tracing::info!(item_id, url = %self.link.url, start, source = source.name(), "segmented transfer");
        let mut segments = match source.open(self.link, &ctx.driver_ctx, self.link.preferred_height(), start).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(item_id, url = %self.link.url, "open playlist: {:#}", e);
                drop(writer);
                ctx.discard_output(self.target).await;
                return TransferOutcome::Failed(FailureKind::ConnectionError);
            }
        };

        ctx.reporter.report_tracker(gate.state().status(), &tracker).await;
        let _ticker = spawn_ticker(ctx.reporter.clone(), tracker.clone(), gate.watch(), ctx.progress_interval);

        let mut done = start;
        let mut first = true;
        loop {
            // segment boundary: the only place pause and stop take effect
            if gate.wait_while_paused().await == RunState::Stopped {
                drop(writer);
                drop(segments);
                ctx.discard_output(self.target).await;
                ctx.report_stopped().await;
                tracing::info!(item_id, segment = done, "stopped");
                return TransferOutcome::Stopped;
            }

            let Some(seg) = segments.next().await else {
                if first && start == 0 {
                    tracing::warn!(item_id, url = %self.link.url, "playlist yielded no segments");
                    drop(writer);
                    ctx.discard_output(self.target).await;
                    return TransferOutcome::Failed(FailureKind::Unknown);
                }
                break;
            };

            if seg.errored {
                tracing::warn!(item_id, segment = seg.index, total = seg.total_segments, "segment fetch failed");
                drop(writer);
                ctx.discard_output(self.target).await;
                return TransferOutcome::Failed(FailureKind::ConnectionError);
            }
            if first && seg.bytes.is_empty() {
                tracing::warn!(item_id, segment = seg.index, "first segment is empty");
                drop(writer);
                ctx.discard_output(self.target).await;
                return TransferOutcome::Failed(FailureKind::Unknown);
            }
            first = false;

            if let Err(e) = append_durably(&mut writer, &seg.bytes).await {
                tracing::warn!(item_id, "write output: {}", e);
                drop(writer);
                ctx.discard_output(self.target).await;
                return TransferOutcome::Failed(FailureKind::ConnectionError);
            }

            let bytes = tracker.add(seg.bytes.len() as u64);
            done = seg.index + 1;
            let estimate = estimate_total(bytes, done, seg.total_segments);
            tracker.set_total(estimate);

            let info = DownloadedFileInfo {
                total_bytes: estimate,
                relative_path: self.target.relative_path().to_string(),
                display_name: self.target.display_name().to_string(),
                extra_info: Some(done.to_string()),
            };
            if let Err(e) = ctx.records.set_file_info(item_id, &info).await {
                tracing::warn!(item_id, segment = done, "persist file info: {:#}", e);
            }
            tracing::debug!(item_id, segment = done, total = seg.total_segments, bytes, "segment appended");
        }

        if let Err(e) = writer.finish().await {
            tracing::warn!(item_id, "flush output: {}", e);
            ctx.discard_output(self.target).await;
            return TransferOutcome::Failed(FailureKind::ConnectionError);
        }

        let (bytes, _) = tracker.snapshot();
        tracker.set_total(bytes);
        ctx.reporter.report_tracker(DownloadStatus::Done, &tracker).await;
        tracing::info!(item_id, segments = done, bytes, "done");
        TransferOutcome::Done
    }
}
