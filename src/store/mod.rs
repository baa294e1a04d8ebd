//! Metadata store: the SQLite database behind every bucket, object, version
//! and multipart upload.
//!
//! Opening the store runs the schema compatibility check against a throwaway
//! copy of the database first, so an incompatible file is never touched.

pub mod buckets;
pub mod error;
pub mod multipart;
pub mod paths;
pub mod retry;
pub mod schema;
pub mod users;
pub mod versions;
pub mod wal;

use crate::config::StoreConfig;
use error::{StorageError, StorageResult};
use retry::{RetryOutcome, RetrySqlite};
use sqlx::{
    Connection, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, info};
use wal::WalController;

pub const DB_FILENAME: &str = "s3gw.db";

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    db_path: PathBuf,
    data_path: PathBuf,
    retry: RetrySqlite,
    wal: Arc<WalController>,
}

impl MetadataStore {
    pub async fn open(cfg: &StoreConfig) -> StorageResult<Self> {
        fs::create_dir_all(&cfg.data_path).await?;
        let db_path = cfg.data_path.join(DB_FILENAME);

        if fs::try_exists(&db_path).await? {
            dry_run_upgrade(&db_path).await?;
        }

        let mut options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(cfg.busy_timeout);
        let custom_wal = !cfg.wal_checkpoint_use_sqlite_default;
        if let Some(limit) = cfg.wal_size_limit.filter(|_| custom_wal) {
            options = options.pragma("journal_size_limit", limit.to_string());
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_with(options)
            .await?;

        {
            let mut conn = pool.acquire().await?;
            schema::upgrade(&mut conn).await?;
        }

        let wal = Arc::new(WalController::new(
            pool.clone(),
            &db_path,
            cfg.wal_size_limit,
            cfg.wal_checkpoint_use_sqlite_default,
        ));
        info!(
            "metadata store open at {} (custom wal checkpoint: {})",
            db_path.display(),
            wal.is_enabled()
        );

        Ok(Self {
            pool,
            db_path,
            data_path: cfg.data_path.clone(),
            retry: RetrySqlite::new(cfg.retry_max_attempts),
            wal,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Root of the payload tree.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn wal(&self) -> &Arc<WalController> {
        &self.wal
    }

    /// Run `work` under the retry wrapper, reporting exhaustion as
    /// [`StorageError::RetriesExhausted`].
    pub async fn retry<T, F, Fut>(&self, work: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let (value, retries, last) = self.retry.run(work).await?.into_parts();
        value.ok_or_else(|| StorageError::RetriesExhausted {
            retries,
            last_error: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Like [`MetadataStore::retry`], for units of work that write. Gives the
    /// WAL controller a chance to checkpoint afterwards.
    pub async fn write<T, F, Fut>(&self, work: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let result = self.retry(work).await;
        if result.is_ok() {
            self.wal.after_write().await;
        }
        result
    }

    /// Raw retry outcome for best-effort callers that skip on exhaustion.
    pub async fn try_write<T, F, Fut>(
        &self,
        work: F,
    ) -> StorageResult<RetryOutcome<T, StorageError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let outcome = self.retry.run(work).await?;
        if outcome.successful() {
            self.wal.after_write().await;
        }
        Ok(outcome)
    }

    pub async fn close(&self) {
        self.wal.shutdown();
        self.pool.close().await;
    }
}

fn tmp_db_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("_tmp");
    PathBuf::from(name)
}

async fn remove_db_files(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(suffix);
        let _ = fs::remove_file(PathBuf::from(name)).await;
    }
}

/// Apply upgrades and the schema sync to a copy of the database. Any error,
/// including a sync that would drop a table, leaves the live file untouched.
async fn dry_run_upgrade(db_path: &Path) -> StorageResult<()> {
    let tmp = tmp_db_path(db_path);
    remove_db_files(&tmp).await;
    fs::copy(db_path, &tmp).await?;
    let wal = wal::wal_path_for(db_path);
    if fs::try_exists(&wal).await? {
        fs::copy(&wal, wal::wal_path_for(&tmp)).await?;
    }
    debug!("schema dry run on {}", tmp.display());

    let result = async {
        let options = SqliteConnectOptions::new().filename(&tmp);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        let upgraded = schema::upgrade(&mut conn).await;
        conn.close().await?;
        upgraded
    }
    .await;

    remove_db_files(&tmp).await;
    result
}
