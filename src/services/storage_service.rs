//! src/services/storage_service.rs
//!
//! StorageService: root of the storage engine. Owns the metadata store, the
//! payload tree under `base_path`, the registry of open bucket handles and
//! the garbage collector. Everything else is reached through a
//! [`BucketHandle`] obtained here.

use crate::{
    config::StoreConfig,
    models::{
        bucket::{Bucket, BucketStats, Placement},
        object::Attrs,
        time::Timestamp,
        user::User,
    },
    services::{bucket::BucketHandle, gc::GarbageCollector},
    store::{
        MetadataStore, buckets,
        error::{StorageError, StorageResult, is_unique_violation},
        users,
    },
};
use parking_lot::Mutex;
use sqlx::types::Json;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Shared by every handle created from one [`StorageService`].
pub struct StoreContext {
    pub store: MetadataStore,
    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,
    pub config: StoreConfig,
}

impl StoreContext {
    /// Absolute path of a payload file given its path relative to the data root.
    pub fn payload_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.base_path.join(relative)
    }

    /// Fail with [`StorageError::QuotaExceeded`] when the data volume is
    /// below the configured free-space threshold.
    pub fn ensure_free_space(&self) -> StorageResult<()> {
        if self.config.min_free_space == 0 {
            return Ok(());
        }
        let available = available_space(&self.base_path)?;
        if available < self.config.min_free_space {
            debug!(
                "refusing write: {} bytes free, {} required",
                available, self.config.min_free_space
            );
            return Err(StorageError::QuotaExceeded);
        }
        Ok(())
    }
}

/// Bytes available to unprivileged writers on the volume holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// StorageService provides the store-level operations:
/// - bucket lifecycle (create, look up, versioning, soft delete, stats)
/// - users owning buckets
/// - access to the garbage collector
///
/// Cloning is cheap; all clones share one registry and one collector.
#[derive(Clone)]
pub struct StorageService {
    ctx: Arc<StoreContext>,
    buckets: Arc<Mutex<HashMap<String, Arc<BucketHandle>>>>,
    gc: Arc<GarbageCollector>,
}

impl StorageService {
    /// Open (and if needed create or upgrade) the store under
    /// `config.data_path`.
    pub async fn open(config: StoreConfig) -> StorageResult<Self> {
        let store = MetadataStore::open(&config).await?;
        Ok(Self::new(store, config))
    }

    pub fn new(store: MetadataStore, config: StoreConfig) -> Self {
        let base_path = config.data_path.clone();
        let ctx = Arc::new(StoreContext {
            store,
            base_path,
            config,
        });
        let gc = Arc::new(GarbageCollector::new(ctx.clone()));
        Self {
            ctx,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            gc,
        }
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub fn store(&self) -> &MetadataStore {
        &self.ctx.store
    }

    pub fn base_path(&self) -> &Path {
        &self.ctx.base_path
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// Start the collector worker and the periodic WAL checkpoint task.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.gc.spawn(self.ctx.config.gc_period)];
        if let Some(task) = self
            .ctx
            .store
            .wal()
            .spawn_periodic(self.ctx.config.wal_checkpoint_interval)
        {
            tasks.push(task);
        }
        tasks
    }

    /// Stop background work and close the pool.
    pub async fn shutdown(&self) {
        self.gc.shutdown();
        self.ctx.store.close().await;
    }

    pub async fn store_user(&self, user: &User) -> StorageResult<()> {
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .write(move || async move { users::store_user(pool, user).await })
            .await
    }

    pub async fn get_user(&self, user_id: &str) -> StorageResult<Option<User>> {
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .retry(move || async move { users::get_user(pool, user_id).await })
            .await
    }

    /// Create a bucket owned by `owner`, registering the owner if needed.
    ///
    /// Names must be unique among live buckets; a soft-deleted bucket does
    /// not block its name.
    pub async fn create_bucket(
        &self,
        name: &str,
        owner: &User,
        placement: Placement,
        versioning: bool,
    ) -> StorageResult<Arc<BucketHandle>> {
        ensure_bucket_name_safe(name)?;
        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: owner.user_id.clone(),
            placement_name: placement.name,
            placement_storage_class: placement.storage_class,
            created_at: Timestamp::now(),
            versioning_enabled: versioning,
            deleted: false,
            attrs: Json(Attrs::new()),
        };

        let pool = self.ctx.store.pool();
        let bucket_ref = &bucket;
        self.ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                if buckets::get_live_by_name(&mut *tx, name).await?.is_some() {
                    return Err(StorageError::BucketAlreadyExists(name.to_string()));
                }
                users::store_user(&mut *tx, owner).await?;
                match buckets::insert_bucket(&mut *tx, bucket_ref).await {
                    Err(StorageError::Sqlx(err)) if is_unique_violation(&err) => {
                        return Err(StorageError::BucketAlreadyExists(name.to_string()));
                    }
                    other => other?,
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!("created bucket {} (versioning: {})", name, versioning);
        let handle = Arc::new(BucketHandle::new(self.ctx.clone(), bucket));
        self.buckets
            .lock()
            .insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle of the live bucket called `name`.
    pub async fn get_bucket(&self, name: &str) -> StorageResult<Arc<BucketHandle>> {
        if let Some(handle) = self.buckets.lock().get(name) {
            return Ok(handle.clone());
        }
        ensure_bucket_name_safe(name)?;
        let pool = self.ctx.store.pool();
        let bucket = self
            .ctx
            .store
            .retry(move || async move { buckets::get_live_by_name(pool, name).await })
            .await?
            .ok_or_else(|| StorageError::BucketNotFound(name.to_string()))?;

        let mut registry = self.buckets.lock();
        let handle = registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BucketHandle::new(self.ctx.clone(), bucket)));
        Ok(handle.clone())
    }

    pub async fn list_buckets(&self, owner_id: Option<&str>) -> StorageResult<Vec<Bucket>> {
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .retry(move || async move { buckets::list_live(pool, owner_id).await })
            .await
    }

    pub async fn set_versioning(&self, name: &str, enabled: bool) -> StorageResult<()> {
        let handle = self.get_bucket(name).await?;
        let id = handle.id();
        let pool = self.ctx.store.pool();
        let rows = self
            .ctx
            .store
            .write(move || async move { buckets::set_versioning(pool, id, enabled).await })
            .await?;
        if rows == 0 {
            self.buckets.lock().remove(name);
            return Err(StorageError::BucketNotFound(name.to_string()));
        }
        handle.set_versioning_cached(enabled);
        Ok(())
    }

    /// Soft-delete a bucket. Its rows and payloads are reclaimed by the
    /// garbage collector.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        let handle = self.get_bucket(name).await?;
        let id = handle.id();
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                if buckets::has_visible_objects(&mut *tx, id).await? {
                    return Err(StorageError::BucketNotEmpty(name.to_string()));
                }
                if buckets::mark_deleted(&mut *tx, id).await? == 0 {
                    return Err(StorageError::BucketNotFound(name.to_string()));
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;
        self.buckets.lock().remove(name);
        info!("bucket {} marked deleted", name);
        Ok(())
    }

    pub async fn bucket_stats(&self, name: &str) -> StorageResult<BucketStats> {
        let handle = self.get_bucket(name).await?;
        let id = handle.id();
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .retry(move || async move { buckets::stats(pool, id).await })
            .await
    }
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Keys never reach the filesystem (payload paths derive from UUIDs), but
/// they are still rejected when empty, oversized or carrying control bytes.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\0')
    {
        return Err(StorageError::InvalidObjectKey);
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }

    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
