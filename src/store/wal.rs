//! Write-ahead log growth control.
//!
//! SQLite's automatic checkpoint can only reset the log when no reader is
//! still using older frames. Under many concurrent writers that moment
//! rarely arrives and the `-wal` file keeps growing. The controller folds the
//! log back into the main file with `wal_checkpoint(TRUNCATE)` whenever it
//! outgrows its ceiling, and on a fixed interval.

use sqlx::SqlitePool;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info};

/// Result row of `PRAGMA wal_checkpoint`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct CheckpointResult {
    /// 1 when the checkpoint could not run to completion.
    pub busy: i64,
    /// Frames in the log.
    pub log: i64,
    /// Frames moved back into the database.
    pub checkpointed: i64,
}

pub struct WalController {
    pool: SqlitePool,
    wal_path: PathBuf,
    size_limit: Option<u64>,
    enabled: bool,
    in_progress: AtomicBool,
    going_down: AtomicBool,
    wake: Notify,
}

pub fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}

impl WalController {
    pub fn new(
        pool: SqlitePool,
        db_path: &Path,
        size_limit: Option<u64>,
        use_sqlite_default: bool,
    ) -> Self {
        Self {
            pool,
            wal_path: wal_path_for(db_path),
            size_limit,
            enabled: !use_sqlite_default && size_limit.is_some(),
            in_progress: AtomicBool::new(false),
            going_down: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Current size of the `-wal` file, 0 when it does not exist.
    pub async fn wal_size(&self) -> u64 {
        tokio::fs::metadata(&self.wal_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Checkpoint and truncate the log now.
    ///
    /// Returns `None` when another checkpoint is already running or the
    /// attempt failed; either way the next trigger tries again.
    pub async fn checkpoint(&self) -> Option<CheckpointResult> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let result = sqlx::query_as::<_, CheckpointResult>("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&self.pool)
            .await;
        self.in_progress.store(false, Ordering::Release);
        match result {
            Ok(res) => {
                if res.busy != 0 {
                    debug!(
                        "wal checkpoint incomplete ({} of {} frames)",
                        res.checkpointed, res.log
                    );
                }
                Some(res)
            }
            Err(err) => {
                debug!("wal checkpoint failed: {}", err);
                None
            }
        }
    }

    /// Called after every write transaction. Checkpoints in the background
    /// once the log is above its ceiling.
    pub async fn after_write(self: &Arc<Self>) {
        let Some(limit) = self.size_limit.filter(|_| self.enabled) else {
            return;
        };
        if self.in_progress.load(Ordering::Acquire) {
            return;
        }
        if self.wal_size().await <= limit {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.checkpoint().await;
        });
    }

    /// Periodic checkpoint task. Exits once [`WalController::shutdown`] is
    /// called. Does nothing when the controller is disabled.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.enabled {
            info!("wal checkpointing left to sqlite");
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            while !this.going_down.load(Ordering::Acquire) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = this.wake.notified() => {}
                }
                if this.going_down.load(Ordering::Acquire) {
                    break;
                }
                if this.wal_size().await > 0 {
                    this.checkpoint().await;
                }
            }
            debug!("wal checkpoint task stopped");
        }))
    }

    pub fn shutdown(&self) {
        self.going_down.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
