use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error_handling::types::FleetError;

/// Where a leased pod's files should end up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSpec {
    pub target: PathBuf,
}

impl BindSpec {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// A running synchronization owned by a pod handle.
///
/// The background task is told to finish through a one-shot signal. It gets the chance to
/// do a last pass before exiting, so cancelling never loses the most recent writes.
/// Dropping the task without cancelling has the same effect.
pub struct SyncTask {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncTask {
    /// Wraps a task that exits once `stop`'s receiver resolves.
    pub fn new(stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Signals the task to finish and detaches from it.
    pub fn cancel(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        debug!("File sync cancelled");
    }

    /// Signals the task to finish and waits for its last pass.
    pub async fn cancel_and_wait(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!("File sync task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start hook for keeping a pod's files in sync with external storage.
pub trait FileSync: Send + Sync {
    /// Begins syncing `data_path` (the pod's private working area) according to `bind`.
    /// `support_path` is a scratch directory the hook may use freely.
    fn start(
        &self,
        bind: &BindSpec,
        data_path: &Path,
        support_path: &Path,
    ) -> Result<SyncTask, FleetError>;
}
