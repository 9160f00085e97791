use crate::core::control::RunState;
use crate::core::events::{EngineEvent, ProgressSink};
use crate::core::model::{DownloadStatus, ItemId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

pub type StatusBoard = Arc<Mutex<HashMap<ItemId, DownloadStatus>>>;

/// Byte counters shared between the read loop and the ticker.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl ProgressTracker {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded: AtomicU64::new(downloaded), total: AtomicU64::new(total) }
    }

    /// Rebases the counters when a new mirror attempt starts.
    pub fn reset(&self, downloaded: u64, total: u64) {
        self.downloaded.store(downloaded, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) -> u64 {
        self.downloaded.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.downloaded.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }
}

/// Fans one item's status/progress out to the status board, the event bus
/// and the progress sink.
pub struct Reporter {
    item_id: ItemId,
    statuses: StatusBoard,
    events: broadcast::Sender<EngineEvent>,
    sink: Arc<dyn ProgressSink>,
}

impl Reporter {
    pub fn new(
        item_id: ItemId,
        statuses: StatusBoard,
        events: broadcast::Sender<EngineEvent>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self { item_id, statuses, events, sink }
    }

    pub async fn report(&self, status: DownloadStatus, downloaded: u64, total: u64) {
        let changed = {
            let mut m = self.statuses.lock().await;
            m.insert(self.item_id, status) != Some(status)
        };
        if changed {
            let _ = self.events.send(EngineEvent::StatusChanged { item_id: self.item_id, status });
        }
        let _ = self.events.send(EngineEvent::Progress { item_id: self.item_id, downloaded, total });
        self.sink.on_progress(self.item_id, status, downloaded, total);
    }

    pub async fn report_tracker(&self, status: DownloadStatus, tracker: &ProgressTracker) {
        let (downloaded, total) = tracker.snapshot();
        self.report(status, downloaded, total).await;
    }

    pub fn deleted(&self) {
        let _ = self.events.send(EngineEvent::Deleted { item_id: self.item_id });
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.events.send(EngineEvent::Error {
            scope: format!("item({})", self.item_id),
            message: message.into(),
        });
    }
}

/// Aborts the ticker when the transfer leaves scope, on every exit path.
pub struct TickerGuard(JoinHandle<()>);

impl Drop for TickerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Emits Downloading progress on a fixed cadence, decoupled from I/O speed.
/// Ticks are skipped while paused; the ticker ends once stopped.
pub fn spawn_ticker(
    reporter: Arc<Reporter>,
    tracker: Arc<ProgressTracker>,
    mut state: watch::Receiver<RunState>,
    every: Duration,
) -> TickerGuard {
    TickerGuard(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let current = *state.borrow_and_update();
            match current {
                RunState::Running => reporter.report_tracker(DownloadStatus::Downloading, &tracker).await,
                RunState::Paused => {}
                RunState::Stopped => break,
            }
        }
    }))
}
