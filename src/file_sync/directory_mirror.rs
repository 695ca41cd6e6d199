use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use walkdir::WalkDir;

use crate::error_handling::types::FleetError;
use crate::file_sync::file_sync_trait::{BindSpec, FileSync, SyncTask};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Polls a pod's data directory and copies new or changed files into the bind target.
///
/// Deletions are not propagated. Files are staged in the support directory and renamed
/// into place, so the target never holds a half-written file. Each pass runs on the
/// blocking thread pool.
pub struct DirectoryMirror {
    interval: Duration,
}

impl DirectoryMirror {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for DirectoryMirror {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_INTERVAL)
    }
}

impl FileSync for DirectoryMirror {
    fn start(
        &self,
        bind: &BindSpec,
        data_path: &Path,
        support_path: &Path,
    ) -> Result<SyncTask, FleetError> {
        let staging = support_path.join("staging");
        fs::create_dir_all(&bind.target)?;
        fs::create_dir_all(&staging)?;

        let mut mirror = Mirror::new(data_path, &bind.target, staging);
        let target = bind.target.clone();
        let interval = self.interval;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        info!(
            "Mirroring {} into {} every {:?}",
            data_path.display(),
            target.display(),
            interval
        );
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                let last = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = &mut stop_rx => true,
                };
                let pass = tokio::task::spawn_blocking(move || {
                    let stats = mirror.pass();
                    (mirror, stats)
                })
                .await;
                let stats = match pass {
                    Ok((returned, stats)) => {
                        mirror = returned;
                        stats
                    }
                    Err(e) => {
                        warn!("Mirror into {} aborted: {}", target.display(), e);
                        break;
                    }
                };
                if stats.copied > 0 {
                    debug!("Mirrored {} file(s) into {}", stats.copied, target.display());
                }
                if stats.failed > 0 {
                    warn!(
                        "{} file(s) could not be mirrored into {}",
                        stats.failed,
                        target.display()
                    );
                }
                if last {
                    break;
                }
            }
            debug!("Mirror into {} finished", target.display());
        });

        Ok(SyncTask::new(stop_tx, task))
    }
}

/// Outcome of one mirror pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PassStats {
    pub copied: usize,
    /// Files skipped after an error. They are retried on the next pass.
    pub failed: usize,
}

/// One source/target pair and what has already been copied.
pub(crate) struct Mirror {
    source: PathBuf,
    target: PathBuf,
    staging: PathBuf,
    seen: HashMap<PathBuf, (SystemTime, u64)>,
    staged: u64,
}

impl Mirror {
    pub(crate) fn new(source: &Path, target: &Path, staging: PathBuf) -> Self {
        Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            staging,
            seen: HashMap::new(),
            staged: 0,
        }
    }

    /// Copies every file that is new or changed since the previous pass. A file that
    /// fails is logged and skipped; the rest of the pass goes on.
    pub(crate) fn pass(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        if !self.source.exists() {
            return stats;
        }

        for entry in WalkDir::new(&self.source).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot walk {}: {}", self.source.display(), e);
                    stats.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.mirror_file(entry.path()) {
                Ok(true) => stats.copied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot mirror {}: {}", entry.path().display(), e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Copies `path` when it changed since it was last mirrored. Returns whether it did.
    fn mirror_file(&mut self, path: &Path) -> io::Result<bool> {
        let meta = fs::metadata(path)?;
        let stamp = (meta.modified()?, meta.len());
        let Ok(relative) = path.strip_prefix(&self.source).map(Path::to_path_buf) else {
            return Ok(false);
        };
        if self.seen.get(&relative) == Some(&stamp) {
            return Ok(false);
        }

        let dest = self.target.join(&relative);
        self.copy_into_place(path, &dest)?;
        self.seen.insert(relative, stamp);
        Ok(true)
    }

    fn copy_into_place(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        self.staged += 1;
        let staged = self.staging.join(format!("{}.part", self.staged));
        fs::copy(from, &staged)?;
        // Rename cannot cross filesystems; fall back to a plain copy
        let placed = fs::rename(&staged, to).or_else(|_| fs::copy(&staged, to).map(|_| ()));
        if staged.exists() {
            let _ = fs::remove_file(&staged);
        }
        placed
    }
}
