use crate::core::control::RunState;
use crate::core::error::{FailureKind, TransferOutcome};
use crate::core::model::{DownloadLink, DownloadStatus, DownloadedFileInfo};
use crate::core::progress::spawn_ticker;
use crate::core::sink::OutputTarget;
use crate::core::transfer::TransferContext;
use crate::plugins::registry::TransferDriver;
use futures::StreamExt;

/// Streams one non-segmented link into its output file.
pub struct SingleFileTransfer<'a> {
    pub link: &'a DownloadLink,
    pub target: &'a OutputTarget,
    /// Continue from the bytes already on disk instead of starting over.
    pub resume: bool,
    /// Declared sizes below this reject an `mp4` target.
    pub min_video_bytes: u64,
}

impl<'a> SingleFileTransfer<'a> {
    pub async fn run(&self, ctx: &TransferContext, driver: &dyn TransferDriver) -> TransferOutcome {
        let item_id = ctx.item_id;
        if self.link.is_torrent() {
            tracing::warn!(item_id, url = %self.link.url, "torrent links are not supported");
            return TransferOutcome::Failed(FailureKind::Unknown);
        }

        let opened = match self.target.open(self.resume).await {
            Ok(o) => o,
            Err(kind) => {
                tracing::warn!(item_id, path = %self.target.path().display(), "open output: {}", kind);
                return TransferOutcome::Failed(kind);
            }
        };
        let offset = opened.existing_len;
        let mut writer = opened.writer;

        let tracker = ctx.tracker.clone();
        tracker.reset(offset, 0);
        let mut gate = ctx.gate.clone();

        tracing::info!(item_id, url = %self.link.url, offset, driver = driver.name(), "single-file transfer");
        let response = match driver.open(self.link, &ctx.driver_ctx, offset).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(item_id, url = %self.link.url, "open connection: {:#}", e);
                return TransferOutcome::Failed(FailureKind::ConnectionError);
            }
        };

        let total = response.content_length.unwrap_or(0) + offset;
        tracker.set_total(total);

        if self.target.extension() == Some("mp4") && total < self.min_video_bytes {
            tracing::warn!(item_id, total, min = self.min_video_bytes, "connection too small");
            drop(writer);
            ctx.discard_output(self.target).await;
            return TransferOutcome::Failed(FailureKind::TooSmall);
        }
        let is_html = response
            .content_type
            .as_deref()
            .map(|ct| ct.trim_start().starts_with("text/html"))
            .unwrap_or(false);
        if is_html {
            tracing::warn!(item_id, url = %self.link.url, "server answered with html");
            drop(writer);
            ctx.discard_output(self.target).await;
            return TransferOutcome::Failed(FailureKind::WrongContent);
        }

        let info = DownloadedFileInfo {
            total_bytes: total,
            relative_path: self.target.relative_path().to_string(),
            display_name: self.target.display_name().to_string(),
            extra_info: None,
        };
        if let Err(e) = ctx.records.set_file_info(item_id, &info).await {
            tracing::warn!(item_id, "persist file info: {:#}", e);
        }

        ctx.reporter.report_tracker(gate.state().status(), &tracker).await;
        let _ticker = spawn_ticker(ctx.reporter.clone(), tracker.clone(), gate.watch(), ctx.progress_interval);

        let mut body = response.body;
        let mut stopped = false;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(item_id, "read body: {}", e);
                    let _ = writer.finish().await;
                    return TransferOutcome::Failed(FailureKind::ConnectionError);
                }
            };

            if gate.state() == RunState::Paused {
                // resume offset is the on-disk length
                if let Err(e) = writer.flush().await {
                    tracing::warn!(item_id, "flush before pause: {}", e);
                }
            }
            if gate.wait_while_paused().await == RunState::Stopped {
                stopped = true;
                break;
            }
            if let Err(e) = writer.append(&chunk).await {
                tracing::warn!(item_id, "write output: {}", e);
                return TransferOutcome::Failed(FailureKind::ConnectionError);
            }
            tracker.add(chunk.len() as u64);
        }

        if stopped || gate.state() == RunState::Stopped {
            drop(writer);
            drop(body);
            ctx.discard_output(self.target).await;
            ctx.report_stopped().await;
            tracing::info!(item_id, "stopped");
            return TransferOutcome::Stopped;
        }

        if let Err(e) = writer.finish().await {
            tracing::warn!(item_id, "flush output: {}", e);
            return TransferOutcome::Failed(FailureKind::ConnectionError);
        }

        ctx.reporter.report_tracker(DownloadStatus::Done, &tracker).await;
        tracing::info!(item_id, bytes = tracker.snapshot().0, "done");
        TransferOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{ControlEvent, EngineEvent};
    use crate::core::model::DownloadAction;
    use crate::core::test_support::{harness, link, FakeDriver, Harness};
    use std::sync::Arc;
    use std::time::Duration;

    fn video(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn transfer<'a>(link: &'a DownloadLink, target: &'a OutputTarget, resume: bool) -> SingleFileTransfer<'a> {
        SingleFileTransfer { link, target, resume, min_video_bytes: 1000 }
    }

    #[tokio::test]
    async fn full_download_writes_every_byte() {
        let h: Harness = harness(1).await;
        let body = video(5000);
        let driver = FakeDriver::default().with_body("https://a.example/v.mp4", body.clone());
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep1");

        let outcome = transfer(&l, &target, false).run(&h.ctx, &driver).await;
        assert_eq!(outcome, TransferOutcome::Done);
        assert_eq!(tokio::fs::read(target.path()).await.unwrap(), body);
        assert_eq!(h.sink.calls().last().map(|c| (c.1, c.2, c.3)), Some((DownloadStatus::Done, 5000, 5000)));

        let info = h.ctx.records.file_info(1).await.unwrap().unwrap();
        assert_eq!(info.total_bytes, 5000);
        assert_eq!(info.display_name, "ep1.mp4");
    }

    #[tokio::test]
    async fn small_declared_length_is_rejected_without_output() {
        let h = harness(2).await;
        let driver = FakeDriver::default().with_body("https://a.example/v.mp4", video(1_000_000));
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep2");

        let t = SingleFileTransfer { link: &l, target: &target, resume: false, min_video_bytes: 5_000_000 };
        assert_eq!(t.run(&h.ctx, &driver).await, TransferOutcome::Failed(FailureKind::TooSmall));
        assert!(target.existing_len().await.is_none());
    }

    #[tokio::test]
    async fn html_responses_are_wrong_content() {
        let h = harness(3).await;
        let driver = FakeDriver::default()
            .with_body("https://a.example/v.mp4", video(4000))
            .with_content_type("text/html; charset=utf-8");
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep3");

        let outcome = transfer(&l, &target, false).run(&h.ctx, &driver).await;
        assert_eq!(outcome, TransferOutcome::Failed(FailureKind::WrongContent));
        assert!(target.existing_len().await.is_none());
    }

    #[tokio::test]
    async fn magnet_links_fail_before_any_request() {
        let h = harness(4).await;
        let driver = FakeDriver::default();
        let l = link("magnet:?xt=urn:btih:abcdef");
        let target = h.target("ep4");

        assert_eq!(
            transfer(&l, &target, false).run(&h.ctx, &driver).await,
            TransferOutcome::Failed(FailureKind::Unknown)
        );
        assert!(driver.opened().is_empty());
        assert!(target.existing_len().await.is_none());
    }

    #[tokio::test]
    async fn resume_requests_the_missing_range_and_matches_a_fresh_download() {
        let h = harness(5).await;
        let body = video(8000);
        let driver = FakeDriver::default().with_body("https://a.example/v.mp4", body.clone());
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep5");
        tokio::fs::write(target.path(), &body[..3000]).await.unwrap();

        let outcome = transfer(&l, &target, true).run(&h.ctx, &driver).await;
        assert_eq!(outcome, TransferOutcome::Done);
        assert_eq!(driver.opened(), vec![("https://a.example/v.mp4".to_string(), 3000)]);
        assert_eq!(tokio::fs::read(target.path()).await.unwrap(), body);
        assert_eq!(h.ctx.records.file_info(5).await.unwrap().unwrap().total_bytes, 8000);
    }

    #[tokio::test]
    async fn stop_discards_output_and_progress_record() {
        let h = harness(6).await;
        let (driver, feed) = FakeDriver::default().streamed("https://a.example/v.mp4", 9000);
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep6");
        let mut events = h.events.subscribe();

        let ctx = h.ctx.clone();
        let driver = Arc::new(driver);
        let d2 = driver.clone();
        let l2 = l.clone();
        let t2 = target.clone();
        let task = tokio::spawn(async move { transfer(&l2, &t2, false).run(&ctx, d2.as_ref()).await });

        driver.wait_opened().await;
        feed.send(video(2000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.control.send(ControlEvent { item_id: 6, action: DownloadAction::Stop }).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        feed.send(video(2000)).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(outcome, TransferOutcome::Stopped);
        assert!(target.existing_len().await.is_none());
        assert!(h.ctx.records.file_info(6).await.unwrap().is_none());

        let mut saw_deleted = false;
        while let Ok(evt) = events.try_recv() {
            if matches!(evt, EngineEvent::Deleted { item_id: 6 }) {
                saw_deleted = true;
            }
        }
        assert!(saw_deleted);
        assert_eq!(h.sink.calls().last().map(|c| (c.1, c.2, c.3)), Some((DownloadStatus::Stopped, 0, 0)));
    }

    #[tokio::test]
    async fn pause_then_resume_keeps_every_byte_exactly_once() {
        let h = harness(7).await;
        let (driver, feed) = FakeDriver::default().streamed("https://a.example/v.mp4", 6000);
        let driver = Arc::new(driver);
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep7");

        let ctx = h.ctx.clone();
        let d2 = driver.clone();
        let l2 = l.clone();
        let t2 = target.clone();
        let task = tokio::spawn(async move { transfer(&l2, &t2, false).run(&ctx, d2.as_ref()).await });

        driver.wait_opened().await;
        let body = video(6000);
        feed.send(body[..2000].to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.control.send(ControlEvent { item_id: 7, action: DownloadAction::Pause }).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        feed.send(body[2000..4000].to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.statuses.lock().await.get(&7), Some(&DownloadStatus::Paused));
        assert_eq!(h.sink.calls().last().map(|c| (c.1, c.2)), Some((DownloadStatus::Paused, 2000)));
        // the bytes counted so far are on disk while parked
        assert_eq!(target.existing_len().await, Some(2000));

        h.control.send(ControlEvent { item_id: 7, action: DownloadAction::Resume }).unwrap();
        feed.send(body[4000..].to_vec()).await.unwrap();
        drop(feed);

        let outcome = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(outcome, TransferOutcome::Done);
        assert_eq!(tokio::fs::read(target.path()).await.unwrap(), body);
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_the_partial_file() {
        let h = harness(8).await;
        let driver = FakeDriver::default().with_body("https://a.example/v.mp4", video(4000)).failing_after(1500);
        let l = link("https://a.example/v.mp4");
        let target = h.target("ep8");

        let outcome = transfer(&l, &target, false).run(&h.ctx, &driver).await;
        assert_eq!(outcome, TransferOutcome::Failed(FailureKind::ConnectionError));
        assert_eq!(target.existing_len().await, Some(1500));
        assert!(h.ctx.records.file_info(8).await.unwrap().is_some());
    }
}
