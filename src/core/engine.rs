use crate::core::config::EngineConfig;
use crate::core::control::{ControlListener, RunGate, RunState};
use crate::core::error::{FailureKind, TransferOutcome};
use crate::core::events::{ControlEvent, EngineEvent, ProgressSink};
use crate::core::fallback::{run_mirrors, FallbackResult, MirrorRunner};
use crate::core::model::*;
use crate::core::progress::{ProgressTracker, Reporter, StatusBoard};
use crate::core::records::Records;
use crate::core::scheduler::{Admission, Scheduler};
use crate::core::sink::OutputTarget;
use crate::core::store::{KeyValueStore, SqliteStore};
use crate::core::transfer::segmented::SegmentedTransfer;
use crate::core::transfer::single::SingleFileTransfer;
use crate::core::transfer::TransferContext;
use crate::plugins::registry::{DriverContext, PluginRegistry, TransferKind};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};

/// The download service. Owns the queue, the active set, the status board
/// and both buses; everything else goes through its methods.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<PluginRegistry>,
    config: Arc<EngineConfig>,
    driver_ctx: DriverContext,
    records: Records,
    event_tx: broadcast::Sender<EngineEvent>,
    control_tx: broadcast::Sender<ControlEvent>,
    statuses: StatusBoard,
    scheduler: Arc<Mutex<Scheduler>>,
    stop_requested: Arc<Mutex<HashSet<ItemId>>>,
    sink: Arc<dyn ProgressSink>,
    wake: Arc<Notify>,
    idle_tx: Arc<watch::Sender<bool>>,
}

impl Engine {
    pub async fn new(
        registry: PluginRegistry,
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.out_dir)
            .await
            .with_context(|| format!("create out_dir {}", config.out_dir.display()))?;

        let (event_tx, _) = broadcast::channel(1024);
        let (control_tx, _) = broadcast::channel(256);
        let (idle_tx, _) = watch::channel(true);

        let engine = Self {
            registry: Arc::new(registry),
            driver_ctx: DriverContext::from_config(&config),
            scheduler: Arc::new(Mutex::new(Scheduler::new(config.max_concurrent_downloads))),
            config: Arc::new(config),
            records: Records::new(store),
            event_tx,
            control_tx,
            statuses: Default::default(),
            stop_requested: Default::default(),
            sink,
            wake: Arc::new(Notify::new()),
            idle_tx: Arc::new(idle_tx),
        };

        // admission task: re-runs admission whenever a slot may have freed
        let admitter = engine.clone();
        tokio::spawn(async move {
            loop {
                admitter.wake.notified().await;
                admitter.admit_next().await;
            }
        });

        Ok(engine)
    }

    /// Engine backed by the SQLite store inside the output directory.
    pub async fn open(registry: PluginRegistry, config: EngineConfig, sink: Arc<dyn ProgressSink>) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.db_path()).await?;
        Self::new(registry, config, Arc::new(store), sink).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn info(&self, scope: impl Into<String>, message: impl Into<String>) {
        let _ = self.event_tx.send(EngineEvent::Info { scope: scope.into(), message: message.into() });
    }

    fn reporter(&self, item_id: ItemId) -> Arc<Reporter> {
        Arc::new(Reporter::new(item_id, self.statuses.clone(), self.event_tx.clone(), self.sink.clone()))
    }

    fn target_for(&self, item: &DownloadItem) -> OutputTarget {
        OutputTarget::new(
            &self.config.out_dir,
            item.destination_folder.as_deref(),
            &item.episode.file_stem(),
            "mp4",
        )
    }

    /// Wraps a provider item in a fresh resume package and queues it.
    pub async fn download_episode(&self, item: DownloadItem) -> anyhow::Result<ItemId> {
        let pkg = ResumePackage::fresh(item);
        let id = pkg.id();
        self.enqueue(pkg).await?;
        Ok(id)
    }

    pub async fn enqueue(&self, pkg: ResumePackage) -> anyhow::Result<()> {
        let id = pkg.id();
        let display_name = self.target_for(&pkg.item).display_name().to_string();
        {
            let mut s = self.scheduler.lock().await;
            s.push(pkg);
            self.idle_tx.send_replace(false);
            self.records.save_queue(&s.snapshot()).await.context("persist queue")?;
        }
        tracing::info!(item_id = id, name = %display_name, "queued");
        let _ = self.event_tx.send(EngineEvent::ItemQueued { item_id: id, display_name });

        self.admit_next().await;
        Ok(())
    }

    /// Starts queued items while capacity allows.
    pub async fn admit_next(&self) {
        loop {
            let admission = {
                let mut s = self.scheduler.lock().await;
                let admission = s.admit();
                if admission != Admission::Idle {
                    if let Err(e) = self.records.save_queue(&s.snapshot()).await {
                        tracing::warn!("persist queue: {:#}", e);
                    }
                }
                if s.is_idle() {
                    self.idle_tx.send_replace(true);
                }
                admission
            };

            match admission {
                Admission::Idle => break,
                Admission::AlreadyActive(id) => {
                    tracing::debug!(item_id = id, "already active, resuming");
                    let _ = self.control_tx.send(ControlEvent { item_id: id, action: DownloadAction::Resume });
                }
                Admission::Start(pkg) => {
                    // subscribe before the item's task exists so no control
                    // action sent after admission can miss it
                    let id = pkg.id();
                    let tracker = Arc::new(ProgressTracker::default());
                    let listener = ControlListener::spawn(&self.control_tx, id, self.reporter(id), tracker.clone());
                    let engine = self.clone();
                    tokio::spawn(async move { engine.run_item(pkg, listener, tracker).await });
                }
            }
        }
    }

    async fn run_item(&self, pkg: ResumePackage, listener: ControlListener, tracker: Arc<ProgressTracker>) {
        let id = pkg.id();
        let reporter = self.reporter(id);
        let target = self.target_for(&pkg.item);
        reporter.report(listener.state().status(), 0, 0).await;
        self.info(format!("item({})", id), format!("starting {}", target.display_name()));

        let runner = ItemRunner {
            engine: self.clone(),
            item: pkg.item.clone(),
            target: target.clone(),
            reporter: reporter.clone(),
            gate: listener.gate(),
            tracker,
        };
        let links = pkg.item.links.clone();
        let link_index = pkg.link_index;

        // the mirrors run in their own task so a panic still releases the slot
        let result = match tokio::spawn(async move { run_mirrors(&links, link_index, &runner).await }).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(item_id = id, "item task aborted: {}", e);
                FallbackResult { outcome: TransferOutcome::Failed(FailureKind::Unknown), attempted: vec![] }
            }
        };
        drop(listener);

        match result.outcome {
            TransferOutcome::Done | TransferOutcome::Stopped => {
                if let Err(e) = self.records.remove_resume_package(id).await {
                    tracing::warn!(item_id = id, "remove resume package: {:#}", e);
                }
            }
            TransferOutcome::Failed(kind) => {
                tracing::error!(item_id = id, attempts = result.attempted.len(), "all mirrors failed: {}", kind);
                reporter.report(DownloadStatus::Failed, 0, 0).await;
            }
        }

        let target_path = (result.outcome == TransferOutcome::Done).then(|| target.path());
        let _ = self.event_tx.send(EngineEvent::ItemFinished { item_id: id, outcome: result.outcome, target_path });

        self.stop_requested.lock().await.remove(&id);
        {
            let mut s = self.scheduler.lock().await;
            s.finish(id);
            if s.is_idle() {
                self.idle_tx.send_replace(true);
            }
        }
        self.wake.notify_one();
    }

    pub fn pause(&self, id: ItemId) {
        let _ = self.control_tx.send(ControlEvent { item_id: id, action: DownloadAction::Pause });
    }

    /// Resumes an active transfer, or re-queues an item that has a persisted
    /// resume package but is not running.
    pub async fn resume(&self, id: ItemId) -> anyhow::Result<()> {
        let (active, queued) = {
            let s = self.scheduler.lock().await;
            (s.is_active(id), s.is_queued(id))
        };
        if active {
            let _ = self.control_tx.send(ControlEvent { item_id: id, action: DownloadAction::Resume });
            return Ok(());
        }
        if queued {
            return Ok(());
        }
        match self.records.resume_package(id).await? {
            Some(pkg) => self.enqueue(pkg).await,
            None => {
                tracing::debug!(item_id = id, "nothing to resume");
                Ok(())
            }
        }
    }

    pub async fn stop(&self, id: ItemId) -> anyhow::Result<()> {
        let active = {
            let mut s = self.scheduler.lock().await;
            if s.is_active(id) {
                true
            } else {
                if s.remove_queued(id) {
                    self.records.save_queue(&s.snapshot()).await.context("persist queue")?;
                }
                if s.is_idle() {
                    self.idle_tx.send_replace(true);
                }
                false
            }
        };

        if active {
            self.stop_requested.lock().await.insert(id);
            let _ = self.control_tx.send(ControlEvent { item_id: id, action: DownloadAction::Stop });
            return Ok(());
        }

        self.records.remove_resume_package(id).await?;
        self.reporter(id).report(DownloadStatus::Stopped, 0, 0).await;
        Ok(())
    }

    pub async fn status(&self, id: ItemId) -> Option<DownloadStatus> {
        self.statuses.lock().await.get(&id).copied()
    }

    pub async fn resume_package(&self, id: ItemId) -> anyhow::Result<Option<ResumePackage>> {
        self.records.resume_package(id).await
    }

    /// Rebuilds the queue after a restart: items that were running first,
    /// then the persisted queue in order. Returns how many were queued.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let running = self.records.resume_packages().await?;
        let queued = self.records.queue_snapshot().await?;

        let mut seen = HashSet::new();
        let mut restored = 0;
        for pkg in running.into_iter().chain(queued.into_iter().map(|e| e.pkg)) {
            let id = pkg.id();
            if !seen.insert(id) {
                continue;
            }
            let known = {
                let s = self.scheduler.lock().await;
                s.is_active(id) || s.is_queued(id)
            };
            if known {
                continue;
            }
            self.enqueue(pkg).await?;
            restored += 1;
        }
        if restored > 0 {
            self.info("restore", format!("re-queued {} item(s)", restored));
        }
        Ok(restored)
    }

    /// The finished or partial output of an item, if it is still on disk.
    /// A record whose file is gone or empty is dropped.
    pub async fn downloaded_file_info(&self, id: ItemId) -> anyhow::Result<Option<DownloadedFileInfoResult>> {
        let Some(info) = self.records.file_info(id).await? else {
            return Ok(None);
        };
        let target = OutputTarget::from_parts(&self.config.out_dir, &info.relative_path, &info.display_name);
        match target.existing_len().await {
            Some(len) if len > 0 => Ok(Some(DownloadedFileInfoResult {
                file_length: len,
                total_bytes: info.total_bytes,
                path: target.path(),
            })),
            _ => {
                tracing::debug!(item_id = id, "dropping stale file record");
                self.records.remove_file_info(id).await?;
                Ok(None)
            }
        }
    }

    /// Stops the item and removes its output. Returns whether a file was
    /// removed.
    pub async fn delete_file(&self, id: ItemId) -> anyhow::Result<bool> {
        self.stop(id).await?;
        let reporter = self.reporter(id);
        reporter.report(DownloadStatus::Stopped, 0, 0).await;
        reporter.deleted();

        let Some(info) = self.records.file_info(id).await? else {
            return Ok(false);
        };
        let target = OutputTarget::from_parts(&self.config.out_dir, &info.relative_path, &info.display_name);
        let removed = target
            .delete()
            .await
            .with_context(|| format!("delete {}", target.path().display()))?;
        self.records.remove_file_info(id).await?;
        tracing::info!(item_id = id, removed, path = %target.path().display(), "deleted");
        Ok(removed)
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

/// Runs the mirrors of one item on behalf of the engine.
struct ItemRunner {
    engine: Engine,
    item: DownloadItem,
    target: OutputTarget,
    reporter: Arc<Reporter>,
    gate: RunGate,
    tracker: Arc<ProgressTracker>,
}

impl ItemRunner {
    async fn stop_requested(&self) -> bool {
        self.gate.state() == RunState::Stopped || self.engine.stop_requested.lock().await.contains(&self.item.id())
    }
}

#[async_trait]
impl MirrorRunner for ItemRunner {
    async fn attempt(&self, index: usize, link: &DownloadLink, resume: bool) -> TransferOutcome {
        let engine = &self.engine;
        let id = self.item.id();

        let ctx = TransferContext {
            item_id: id,
            reporter: self.reporter.clone(),
            records: engine.records.clone(),
            gate: self.gate.clone(),
            tracker: self.tracker.clone(),
            driver_ctx: engine.driver_ctx.clone(),
            progress_interval: engine.config.progress_interval,
        };

        if self.stop_requested().await {
            ctx.discard_output(&self.target).await;
            ctx.report_stopped().await;
            return TransferOutcome::Stopped;
        }

        // a restart must find this mirror index before any request goes out
        let pkg = ResumePackage { item: self.item.clone(), link_index: Some(index) };
        if let Err(e) = engine.records.set_resume_package(&pkg).await {
            tracing::error!(item_id = id, mirror = index, "persist resume package: {:#}", e);
            self.reporter.error(format!("mirror {} ({}) not attempted: resume state unavailable", index + 1, link.display_name));
            return TransferOutcome::Failed(FailureKind::StorageUnavailable);
        }

        // Stop may have landed while the package was being written
        if self.stop_requested().await {
            ctx.discard_output(&self.target).await;
            ctx.report_stopped().await;
            return TransferOutcome::Stopped;
        }

        let _ = engine.event_tx.send(EngineEvent::MirrorAttempt { item_id: id, index, url: link.url.clone() });
        tracing::info!(item_id = id, mirror = index, name = %link.display_name, resume, "trying mirror");

        let outcome = match PluginRegistry::route(link) {
            TransferKind::SingleFile => {
                let driver = engine.registry.driver();
                SingleFileTransfer {
                    link,
                    target: &self.target,
                    resume,
                    min_video_bytes: engine.config.min_video_bytes,
                }
                .run(&ctx, driver.as_ref())
                .await
            }
            TransferKind::Segmented => {
                let source = engine.registry.segment_source();
                SegmentedTransfer { link, target: &self.target, resume }.run(&ctx, source.as_ref()).await
            }
        };

        if let TransferOutcome::Failed(kind) = outcome {
            if self.stop_requested().await {
                ctx.report_stopped().await;
                return TransferOutcome::Stopped;
            }
            self.reporter.error(format!("mirror {} ({}) failed: {}", index + 1, link.display_name, kind));
            if kind == FailureKind::StorageUnavailable {
                tracing::error!(item_id = id, path = %self.target.path().display(), "output location unavailable");
            }
        }
        outcome
    }
}
