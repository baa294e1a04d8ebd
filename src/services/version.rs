//! Handle on a single version row.

use crate::{
    models::{
        object::{Attrs, ObjectRow, ObjectState, Version},
        time::Timestamp,
    },
    services::bucket::BucketHandle,
    store::{
        error::{StorageError, StorageResult},
        paths,
        versions::{self, CommitFields},
    },
};
use sqlx::types::Json;
use std::{path::PathBuf, sync::Arc};
use tracing::debug;

/// Payload summary recorded when a version is committed.
#[derive(Clone, Debug, Default)]
pub struct CommitInfo {
    pub size: i64,
    pub etag: String,
    pub checksum: String,
}

/// A version as loaded from, or just inserted into, the database.
///
/// The handle only exists once its row does; there is no way to obtain a
/// half-initialized version.
pub struct ObjectVersion {
    bucket: Arc<BucketHandle>,
    object: ObjectRow,
    version: Version,
}

impl ObjectVersion {
    pub(crate) fn new(bucket: Arc<BucketHandle>, object: ObjectRow, version: Version) -> Self {
        Self {
            bucket,
            object,
            version,
        }
    }

    pub fn bucket(&self) -> &Arc<BucketHandle> {
        &self.bucket
    }

    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn object(&self) -> &ObjectRow {
        &self.object
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn row_id(&self) -> i64 {
        self.version.id
    }

    pub fn version_id(&self) -> &str {
        &self.version.version_id
    }

    pub fn state(&self) -> ObjectState {
        self.version.object_state
    }

    pub fn attrs(&self) -> &Attrs {
        &self.version.attrs.0
    }

    pub fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.version.attrs.0
    }

    /// Payload path relative to the data root.
    pub fn relative_path(&self) -> PathBuf {
        paths::version_path(&self.object.uuid, self.version.id)
    }

    /// Absolute payload path.
    pub fn path(&self) -> PathBuf {
        self.bucket.context().payload_path(self.relative_path())
    }

    /// Promote this version from OPEN to COMMITTED.
    ///
    /// Returns `false` if the version is no longer OPEN. On an unversioned
    /// bucket every other COMMITTED version of the object is soft-deleted in
    /// the same transaction, so exactly one stays visible.
    pub async fn commit(&mut self, info: CommitInfo) -> StorageResult<bool> {
        let ctx = self.bucket.context();
        let pool = ctx.store.pool();
        let versioned = self.bucket.versioned();
        let id = self.version.id;
        let object_id = self.object.uuid;
        let now = Timestamp::now();
        let fields = CommitFields {
            size: info.size,
            checksum: &info.checksum,
            etag: &info.etag,
            attrs: &self.version.attrs,
            time: now,
        };
        let fields = &fields;

        let committed = ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                if versions::commit_version(&mut *tx, id, fields).await? == 0 {
                    if versions::get_version(&mut *tx, id).await?.is_none() {
                        return Err(StorageError::Inconsistency(format!(
                            "version row {} vanished before commit",
                            id
                        )));
                    }
                    return Ok(false);
                }
                if !versioned {
                    versions::delete_other_committed(&mut *tx, object_id, id, now).await?;
                }
                tx.commit().await?;
                Ok(true)
            })
            .await?;

        if committed {
            self.version.object_state = ObjectState::Committed;
            self.version.commit_time = now;
            self.version.mtime = now;
            self.version.size = info.size;
            self.version.etag = info.etag;
            self.version.checksum = info.checksum;
        } else {
            debug!("commit of version row {} lost: not open anymore", id);
        }
        Ok(committed)
    }

    /// Persist the attribute map. Never changes the version's state.
    pub async fn flush_attrs(&mut self) -> StorageResult<()> {
        let ctx = self.bucket.context();
        let pool = ctx.store.pool();
        let id = self.version.id;
        let attrs: &Json<Attrs> = &self.version.attrs;
        let now = Timestamp::now();
        let rows = ctx
            .store
            .write(move || async move { versions::update_attrs(pool, id, attrs, now).await })
            .await?;
        if rows == 0 {
            return Err(StorageError::object_not_found(
                &self.bucket.name(),
                &self.object.name,
            ));
        }
        self.version.mtime = now;
        Ok(())
    }

    /// Soft-delete this version, whatever its state.
    pub async fn mark_deleted(&mut self) -> StorageResult<bool> {
        let ctx = self.bucket.context();
        let pool = ctx.store.pool();
        let id = self.version.id;
        let now = Timestamp::now();
        let rows = ctx
            .store
            .write(move || async move { versions::mark_deleted(pool, id, now).await })
            .await?;
        if rows > 0 {
            self.version.object_state = ObjectState::Deleted;
            self.version.delete_time = now;
        }
        Ok(rows > 0)
    }

    /// Reload the row from the database.
    pub async fn refresh(&mut self) -> StorageResult<()> {
        let ctx = self.bucket.context();
        let pool = ctx.store.pool();
        let id = self.version.id;
        let version = ctx
            .store
            .retry(move || async move { versions::get_version(pool, id).await })
            .await?
            .ok_or_else(|| StorageError::object_not_found(&self.bucket.name(), &self.object.name))?;
        self.version = version;
        Ok(())
    }
}
