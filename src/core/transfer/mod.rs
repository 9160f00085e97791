pub mod segmented;
pub mod single;

use crate::core::control::RunGate;
use crate::core::model::{DownloadStatus, ItemId};
use crate::core::progress::{ProgressTracker, Reporter};
use crate::core::records::Records;
use crate::core::sink::OutputTarget;
use crate::plugins::registry::DriverContext;
use std::sync::Arc;
use std::time::Duration;

/// Everything an executor needs besides the link and the target.
#[derive(Clone)]
pub struct TransferContext {
    pub item_id: ItemId,
    pub reporter: Arc<Reporter>,
    pub records: Records,
    /// Shared with the item's control listener, which outlives the attempt.
    pub gate: RunGate,
    pub tracker: Arc<ProgressTracker>,
    pub driver_ctx: DriverContext,
    pub progress_interval: Duration,
}

impl TransferContext {
    /// Removes the partial output together with its progress record.
    pub async fn discard_output(&self, target: &OutputTarget) {
        match target.delete().await {
            Ok(_) => {
                if let Err(e) = self.records.remove_file_info(self.item_id).await {
                    tracing::warn!(item_id = self.item_id, "remove file info: {:#}", e);
                }
                self.reporter.deleted();
            }
            Err(e) => tracing::warn!(item_id = self.item_id, path = %target.path().display(), "delete output: {}", e),
        }
    }

    pub async fn report_stopped(&self) {
        self.reporter.report(DownloadStatus::Stopped, 0, 0).await;
    }
}
