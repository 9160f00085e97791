use crate::core::events::ControlEvent;
use crate::core::model::{DownloadAction, DownloadStatus, ItemId};
use crate::core::progress::{ProgressTracker, Reporter};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

impl RunState {
    /// Stopped is absorbing.
    pub fn apply(self, action: DownloadAction) -> RunState {
        match (self, action) {
            (RunState::Stopped, _) => RunState::Stopped,
            (_, DownloadAction::Stop) => RunState::Stopped,
            (_, DownloadAction::Pause) => RunState::Paused,
            (_, DownloadAction::Resume) => RunState::Running,
        }
    }

    pub fn status(self) -> DownloadStatus {
        match self {
            RunState::Running => DownloadStatus::Downloading,
            RunState::Paused => DownloadStatus::Paused,
            RunState::Stopped => DownloadStatus::Stopped,
        }
    }
}

/// An item's subscription to the control bus, filtered to its own id.
/// It lives for the whole run of the item, across mirror attempts, so a
/// Pause or Stop sent between attempts is not lost. Dropping it
/// unsubscribes.
pub struct ControlListener {
    state: watch::Receiver<RunState>,
    task: JoinHandle<()>,
}

impl ControlListener {
    pub fn spawn(
        bus: &broadcast::Sender<ControlEvent>,
        item_id: ItemId,
        reporter: Arc<Reporter>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        // subscribe before spawning so nothing sent after this call is missed
        let mut rx = bus.subscribe();
        let (tx, state) = watch::channel(RunState::Running);

        let task = tokio::spawn(async move {
            loop {
                let evt = match rx.recv().await {
                    Ok(evt) => evt,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(item_id, skipped = n, "control listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if evt.item_id != item_id {
                    continue;
                }

                let prev = *tx.borrow();
                let next = prev.apply(evt.action);
                tracing::debug!(item_id, action = ?evt.action, ?prev, ?next, "control action");
                if next == prev {
                    continue;
                }
                tx.send_replace(next);
                reporter.report_tracker(next.status(), &tracker).await;
            }
        });

        Self { state, task }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// A read-only handle on the run state for one executor.
    pub fn gate(&self) -> RunGate {
        RunGate { state: self.state.clone() }
    }
}

/// The pause/stop gate an executor checks at its cooperative checkpoints.
#[derive(Clone)]
pub struct RunGate {
    state: watch::Receiver<RunState>,
}

impl RunGate {
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Parks until the transfer is no longer paused and returns the state
    /// it resumed into (Running or Stopped).
    pub async fn wait_while_paused(&mut self) -> RunState {
        loop {
            let current = *self.state.borrow_and_update();
            if current != RunState::Paused {
                return current;
            }
            if self.state.changed().await.is_err() {
                return RunState::Stopped;
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
