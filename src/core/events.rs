use crate::core::error::TransferOutcome;
use crate::core::model::{DownloadAction, DownloadStatus, ItemId};
use std::path::PathBuf;

/// Observer-facing stream. Events for one item arrive in emission order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ItemQueued { item_id: ItemId, display_name: String },
    StatusChanged { item_id: ItemId, status: DownloadStatus },
    Progress { item_id: ItemId, downloaded: u64, total: u64 },
    MirrorAttempt { item_id: ItemId, index: usize, url: String },
    ItemFinished { item_id: ItemId, outcome: TransferOutcome, target_path: Option<PathBuf> },
    Deleted { item_id: ItemId },
    Error { scope: String, message: String },
    Info { scope: String, message: String },
}

/// Control actions addressed to an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEvent {
    pub item_id: ItemId,
    pub action: DownloadAction,
}

/// Receives periodic progress, independent of how it gets rendered.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, item_id: ItemId, status: DownloadStatus, downloaded: u64, total: u64);
}

/// Default sink: progress goes to the log only.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, item_id: ItemId, status: DownloadStatus, downloaded: u64, total: u64) {
        tracing::debug!(item_id, ?status, downloaded, total, "progress");
    }
}
