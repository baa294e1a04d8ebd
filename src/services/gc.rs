//! Garbage collector.
//!
//! The only component that physically removes rows and payload files. One
//! iteration works through, in order:
//! 1. soft-deleted buckets: their uploads and parts, then their versions and
//!    objects, then the bucket row once nothing is left;
//! 2. DELETED versions of live buckets;
//! 3. DONE and ABORTED uploads: remaining parts, then the upload row.
//!
//! Each physical version or part removal consumes one unit of the
//! per-iteration budget; an iteration also stops once its time cap is hit.
//! Remaining work is picked up by the next iteration.

use crate::{
    models::{multipart::MultipartUpload, object::Version},
    services::storage_service::StoreContext,
    store::{
        buckets,
        error::{ClassifyError, ErrorClass, StorageError, StorageResult},
        multipart as mp, paths, versions,
    },
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    future::Future,
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one iteration removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub versions_deleted: u64,
    pub objects_deleted: u64,
    pub parts_deleted: u64,
    pub uploads_deleted: u64,
    pub buckets_deleted: u64,
    /// Stopped early because the budget or the time cap ran out.
    pub interrupted: bool,
    pub elapsed_ms: u64,
}

impl GcStats {
    pub fn total(&self) -> u64 {
        self.versions_deleted
            + self.objects_deleted
            + self.parts_deleted
            + self.uploads_deleted
            + self.buckets_deleted
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GcStatus {
    pub suspended: bool,
    pub running: bool,
    pub iterations: u64,
    pub last_iteration: Option<GcStats>,
}

struct Budget {
    remaining: usize,
    deadline: Instant,
}

impl Budget {
    fn exhausted(&self) -> bool {
        self.remaining == 0 || Instant::now() >= self.deadline
    }

    fn consume(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }
}

pub struct GarbageCollector {
    ctx: Arc<StoreContext>,
    suspended: AtomicBool,
    going_down: AtomicBool,
    running: AtomicBool,
    iterations: AtomicU64,
    last: Mutex<Option<GcStats>>,
    iteration_lock: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl GarbageCollector {
    pub fn new(ctx: Arc<StoreContext>) -> Self {
        Self {
            ctx,
            suspended: AtomicBool::new(false),
            going_down: AtomicBool::new(false),
            running: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
            last: Mutex::new(None),
            iteration_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// The worker skips iterations while suspended.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        debug!("gc suspended");
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        debug!("gc resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Ask the worker to exit after its current iteration.
    pub fn shutdown(&self) {
        self.going_down.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn status(&self) -> GcStatus {
        GcStatus {
            suspended: self.is_suspended(),
            running: self.running.load(Ordering::Acquire),
            iterations: self.iterations.load(Ordering::Acquire),
            last_iteration: self.last.lock().clone(),
        }
    }

    /// Run the periodic worker. Each iteration sleeps for the period minus
    /// its own processing time, or a full period if it overran.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!("gc worker started (period {:?})", period);
            while !this.going_down.load(Ordering::Acquire) {
                let started = Instant::now();
                if !this.is_suspended() {
                    if let Err(err) = this.process().await {
                        if err.is_critical() {
                            error!("gc stopping after critical error: {}", err);
                            break;
                        }
                        warn!("gc iteration failed: {}", err);
                    }
                }
                let elapsed = started.elapsed();
                let pause = if elapsed >= period {
                    period
                } else {
                    period - elapsed
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = this.wake.notified() => {}
                }
            }
            debug!("gc worker stopped");
        })
    }

    /// One iteration with the configured budget.
    pub async fn process(&self) -> StorageResult<GcStats> {
        self.process_with_budget(self.ctx.config.gc_max_objects_per_iteration)
            .await
    }

    /// One iteration allowed to remove at most `max_items` versions/parts.
    pub async fn process_with_budget(&self, max_items: usize) -> StorageResult<GcStats> {
        let _guard = self.iteration_lock.lock().await;
        self.running.store(true, Ordering::Release);
        let started = Instant::now();
        let mut budget = Budget {
            remaining: max_items,
            deadline: started + self.ctx.config.gc_max_process_time,
        };
        let mut stats = GcStats::default();
        debug!("gc iteration start (budget {})", max_items);

        let result = self.run_steps(&mut budget, &mut stats).await;
        self.running.store(false, Ordering::Release);

        stats.interrupted = budget.exhausted();
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        if stats.interrupted {
            debug!("gc iteration exit due to max process time or budget");
        }
        debug!("gc iteration stop");
        self.iterations.fetch_add(1, Ordering::AcqRel);
        *self.last.lock() = Some(stats.clone());
        result?;
        if stats.total() > 0 {
            info!(
                "gc removed {} versions, {} objects, {} parts, {} uploads, {} buckets in {} ms",
                stats.versions_deleted,
                stats.objects_deleted,
                stats.parts_deleted,
                stats.uploads_deleted,
                stats.buckets_deleted,
                stats.elapsed_ms
            );
        }
        Ok(stats)
    }

    async fn run_steps(&self, budget: &mut Budget, stats: &mut GcStats) -> StorageResult<()> {
        self.process_deleted_buckets(budget, stats).await?;
        if !budget.exhausted() {
            self.process_deleted_versions(budget, stats).await?;
        }
        if !budget.exhausted() {
            self.process_finished_uploads(budget, stats).await?;
        }
        Ok(())
    }

    /// Best-effort write: busy exhaustion and "gone already" are no-ops.
    async fn try_write<T, F, Fut>(&self, work: F) -> StorageResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match self.ctx.store.try_write(work).await {
            Ok(outcome) => {
                if !outcome.successful() {
                    debug!(
                        "gc skipping busy work after {} retries",
                        outcome.retries()
                    );
                }
                Ok(outcome.value())
            }
            Err(err) if err.classify() == ErrorClass::Critical => Err(err),
            Err(err) if err.is_not_found() => Ok(None),
            Err(StorageError::Sqlx(sqlx::Error::RowNotFound)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn read<T, F, Fut>(&self, work: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.ctx.store.retry(work).await
    }

    async fn process_deleted_buckets(
        &self,
        budget: &mut Budget,
        stats: &mut GcStats,
    ) -> StorageResult<()> {
        let pool = self.ctx.store.pool();
        let deleted = self
            .read(move || async move { buckets::list_deleted(pool).await })
            .await?;

        for bucket in deleted {
            if budget.exhausted() {
                return Ok(());
            }
            let bucket_id = bucket.id;
            debug!("gc cleaning deleted bucket {}", bucket.name);
            self.try_write(move || async move { mp::abort_all_of_bucket(pool, bucket_id).await })
                .await?;

            let uploads = self
                .read(move || async move { mp::uploads_of_bucket(pool, bucket_id).await })
                .await?;
            for upload in &uploads {
                self.delete_upload(upload, budget, stats).await?;
                if budget.exhausted() {
                    return Ok(());
                }
            }

            let limit = budget.remaining as i64;
            let doomed = self
                .read(move || async move {
                    versions::versions_of_bucket(pool, bucket_id, limit).await
                })
                .await?;
            for version in &doomed {
                if budget.exhausted() {
                    return Ok(());
                }
                self.delete_version(version, stats).await?;
                budget.consume();
            }

            if let Some(rows) = self
                .try_write(move || async move {
                    versions::remove_empty_objects_of_bucket(pool, bucket_id).await
                })
                .await?
            {
                stats.objects_deleted += rows;
            }
            if let Some(rows) = self
                .try_write(move || async move { buckets::remove_if_empty(pool, bucket_id).await })
                .await?
            {
                if rows > 0 {
                    debug!("gc removed bucket {}", bucket.name);
                    stats.buckets_deleted += rows;
                }
            }
        }
        Ok(())
    }

    async fn process_deleted_versions(
        &self,
        budget: &mut Budget,
        stats: &mut GcStats,
    ) -> StorageResult<()> {
        let pool = self.ctx.store.pool();
        let limit = budget.remaining as i64;
        let doomed = self
            .read(move || async move { versions::deleted_versions(pool, limit).await })
            .await?;
        for version in &doomed {
            if budget.exhausted() {
                break;
            }
            self.delete_version(version, stats).await?;
            budget.consume();
        }
        Ok(())
    }

    async fn process_finished_uploads(
        &self,
        budget: &mut Budget,
        stats: &mut GcStats,
    ) -> StorageResult<()> {
        let pool = self.ctx.store.pool();
        let limit = budget.remaining as i64;
        let finished = self
            .read(move || async move { mp::list_finished(pool, limit).await })
            .await?;
        for upload in &finished {
            if budget.exhausted() {
                break;
            }
            self.delete_upload(upload, budget, stats).await?;
        }
        Ok(())
    }

    /// Remove the parts of an upload (each consuming budget) and then the
    /// upload row if no part is left.
    async fn delete_upload(
        &self,
        upload: &MultipartUpload,
        budget: &mut Budget,
        stats: &mut GcStats,
    ) -> StorageResult<()> {
        let pool = self.ctx.store.pool();
        let upload_id = upload.upload_id.as_str();
        let parts = self
            .read(move || async move { mp::all_parts(pool, upload_id).await })
            .await?;
        for part in &parts {
            if budget.exhausted() {
                return Ok(());
            }
            let path = self
                .ctx
                .payload_path(paths::part_path(&upload.object_uuid, part.part_num));
            remove_payload(&path).await?;
            let part_id = part.id;
            if let Some(rows) = self
                .try_write(move || async move { mp::remove_part(pool, part_id).await })
                .await?
            {
                stats.parts_deleted += rows;
            }
            budget.consume();
        }
        self.prune(&upload.object_uuid).await;

        if let Some(rows) = self
            .try_write(move || async move { mp::remove_upload_if_no_parts(pool, upload_id).await })
            .await?
        {
            stats.uploads_deleted += rows;
        }
        Ok(())
    }

    /// Remove a version's payload, its row, and its object row when it was
    /// the last version.
    async fn delete_version(&self, version: &Version, stats: &mut GcStats) -> StorageResult<()> {
        let path = self
            .ctx
            .payload_path(paths::version_path(&version.object_id, version.id));
        remove_payload(&path).await?;

        let pool = self.ctx.store.pool();
        let id = version.id;
        let object_id = version.object_id;
        let removed = self
            .try_write(move || async move {
                let mut tx = pool.begin().await?;
                let versions_removed = versions::remove_version(&mut *tx, id).await?;
                let objects_removed = versions::remove_object_if_empty(&mut *tx, object_id).await?;
                tx.commit().await?;
                Ok((versions_removed, objects_removed))
            })
            .await?;
        if let Some((versions_removed, objects_removed)) = removed {
            stats.versions_deleted += versions_removed;
            stats.objects_deleted += objects_removed;
        }
        self.prune(&object_id).await;
        Ok(())
    }

    async fn prune(&self, uuid: &Uuid) {
        let dir = self.ctx.payload_path(paths::object_dir(uuid));
        paths::prune_empty_dirs(&dir, &self.ctx.base_path).await;
    }
}

async fn remove_payload(path: &Path) -> StorageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::Io(err)),
    }
}
