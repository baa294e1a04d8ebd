//! Bucket handle: the object and version state machine.
//!
//! Every operation runs as one transaction under the retry wrapper, so a
//! reader sees an object either before or after a commit, never halfway.

use crate::{
    models::{
        bucket::Bucket,
        object::{NamedVersion, ObjectKey, ObjectState, Version, VersionEntry},
        time::Timestamp,
    },
    services::{
        multipart_service::MultipartUploadHandle,
        storage_service::{StoreContext, ensure_key_safe},
        version::ObjectVersion,
    },
    store::{
        error::{StorageError, StorageResult},
        versions::{self, VersionMarker},
    },
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// Version id S3 clients send for the implicit version of an unversioned
/// object.
pub const NULL_VERSION_ID: &str = "null";

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<NamedVersion>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ListVersionsParams {
    pub prefix: Option<String>,
    pub marker: Option<VersionMarker>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListVersionsResult {
    pub versions: Vec<VersionEntry>,
    pub is_truncated: bool,
    pub next_marker: Option<VersionMarker>,
}

/// What a delete did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// A version changed state, was created or was removed.
    pub deleted: bool,
    /// The operation created or removed a delete marker.
    pub delete_marker: bool,
    /// Version id of the delete marker created or removed.
    pub version_id: Option<String>,
}

pub struct BucketHandle {
    ctx: Arc<StoreContext>,
    info: RwLock<Bucket>,
    pub(crate) uploads: Mutex<HashMap<String, Arc<MultipartUploadHandle>>>,
}

impl BucketHandle {
    pub(crate) fn new(ctx: Arc<StoreContext>, info: Bucket) -> Self {
        Self {
            ctx,
            info: RwLock::new(info),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub fn info(&self) -> Bucket {
        self.info.read().clone()
    }

    pub fn id(&self) -> Uuid {
        self.info.read().id
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn versioned(&self) -> bool {
        self.info.read().versioning_enabled
    }

    pub(crate) fn set_versioning_cached(&self, enabled: bool) {
        self.info.write().versioning_enabled = enabled;
    }

    /// Version id a request actually targets. On an unversioned bucket the
    /// `null` id addresses the implicit version.
    fn effective_version_id<'a>(&self, key: &'a ObjectKey) -> Option<&'a str> {
        let id = key.version_id.as_deref()?;
        if id.is_empty() || (!self.versioned() && id == NULL_VERSION_ID) {
            None
        } else {
            Some(id)
        }
    }

    /// Insert an OPEN version of `name`, creating the object row on first
    /// use. Without an explicit id, a versioned bucket draws a random one and
    /// an unversioned bucket uses the empty id.
    pub async fn create_version(
        self: &Arc<Self>,
        name: &str,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectVersion> {
        ensure_key_safe(name)?;
        let version_id = match version_id.filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None if self.versioned() => new_version_id(),
            None => String::new(),
        };
        let bucket_id = self.id();
        let pool = self.ctx.store.pool();
        let version_id = version_id.as_str();

        let (object, version) = self
            .ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                let object = versions::get_or_insert_object(&mut tx, bucket_id, name).await?;
                let mut version = Version::new_open(object.uuid, version_id);
                version.id = versions::insert_version(&mut *tx, &version).await?;
                tx.commit().await?;
                Ok((object, version))
            })
            .await?;
        debug!(
            "created open version {} of {} (row {})",
            version.version_id, name, version.id
        );
        Ok(ObjectVersion::new(self.clone(), object, version))
    }

    /// The visible version addressed by `key`.
    ///
    /// Without a version id this is the newest COMMITTED version, unless that
    /// is a delete marker. With a version id it is the COMMITTED version
    /// carrying that id. OPEN and DELETED versions are never returned.
    pub async fn get(self: &Arc<Self>, key: &ObjectKey) -> StorageResult<ObjectVersion> {
        ensure_key_safe(&key.name)?;
        let bucket_id = self.id();
        let name = key.name.as_str();
        let version_id = self.effective_version_id(key);
        let pool = self.ctx.store.pool();

        let found = self
            .ctx
            .store
            .retry(move || async move {
                let mut tx = pool.begin().await?;
                let Some(object) = versions::find_object(&mut *tx, bucket_id, name).await? else {
                    return Ok(None);
                };
                let version = match version_id {
                    Some(id) => versions::by_version_id(&mut *tx, object.uuid, id)
                        .await?
                        .filter(|v| v.object_state == ObjectState::Committed),
                    None => versions::latest_committed(&mut *tx, object.uuid).await?,
                };
                tx.commit().await?;
                Ok(version.map(|v| (object, v)))
            })
            .await?;

        match found {
            Some((object, version)) if !version.is_delete_marker() => {
                Ok(ObjectVersion::new(self.clone(), object, version))
            }
            _ => Err(StorageError::object_not_found(&self.name(), &key.to_string())),
        }
    }

    /// Every object whose newest committed version is a regular one.
    pub async fn get_all(&self) -> StorageResult<Vec<NamedVersion>> {
        let bucket_id = self.id();
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .retry(move || async move {
                versions::visible_objects(pool, bucket_id, "", "", None, i64::MAX).await
            })
            .await
    }

    /// Delete `key`.
    ///
    /// - unversioned bucket: the visible version becomes DELETED.
    /// - versioned bucket, with a version id: that version becomes DELETED,
    ///   or, when it is the newest delete marker, the marker is removed and
    ///   the previous version is visible again.
    /// - versioned bucket, no version id: a new delete marker is committed,
    ///   even when the object never existed.
    pub async fn delete(&self, key: &ObjectKey) -> StorageResult<DeleteResult> {
        ensure_key_safe(&key.name)?;
        let versioned = self.versioned();
        let version_id = self.effective_version_id(key);
        if versioned && version_id.is_none() {
            return self.create_delete_marker(&key.name).await;
        }

        let bucket_id = self.id();
        let name = key.name.as_str();
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                let Some(object) = versions::find_object(&mut *tx, bucket_id, name).await? else {
                    return Ok(DeleteResult::default());
                };
                let target = match version_id {
                    Some(id) => versions::by_version_id(&mut *tx, object.uuid, id).await?,
                    None => versions::latest_committed(&mut *tx, object.uuid).await?,
                };
                let Some(target) = target else {
                    return Ok(DeleteResult::default());
                };

                let mut result = DeleteResult::default();
                if target.is_delete_marker() {
                    result.delete_marker = true;
                    result.version_id = Some(target.version_id.clone());
                    let newest = versions::latest_committed(&mut *tx, object.uuid).await?;
                    if newest.is_some_and(|v| v.id == target.id) {
                        result.deleted = versions::remove_version(&mut *tx, target.id).await? > 0;
                        tx.commit().await?;
                        return Ok(result);
                    }
                }
                result.deleted =
                    versions::mark_deleted(&mut *tx, target.id, Timestamp::now()).await? > 0;
                tx.commit().await?;
                Ok(result)
            })
            .await
    }

    async fn create_delete_marker(&self, name: &str) -> StorageResult<DeleteResult> {
        let bucket_id = self.id();
        let marker_id = new_version_id();
        let marker_id_ref = marker_id.as_str();
        let pool = self.ctx.store.pool();
        self.ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                let object = versions::get_or_insert_object(&mut tx, bucket_id, name).await?;
                let marker = Version::new_delete_marker(object.uuid, marker_id_ref);
                versions::insert_version(&mut *tx, &marker).await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;
        debug!("delete marker {} created for {}", marker_id, name);
        Ok(DeleteResult {
            deleted: true,
            delete_marker: true,
            version_id: Some(marker_id),
        })
    }

    /// List visible objects in name order.
    ///
    /// Supports prefix filtering, delimiter grouping and continuation, with a
    /// `max_keys + 1` over-fetch to detect truncation.
    pub async fn list_objects(&self, params: &ListObjectsParams) -> StorageResult<ListObjectsResult> {
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;
        let bucket_id = self.id();
        let prefix = params.prefix.as_deref().unwrap_or("");
        let delimiter = params.delimiter.as_deref().filter(|d| !d.is_empty());
        let after = params
            .continuation_token
            .as_deref()
            .or(params.start_after.as_deref())
            .unwrap_or("");
        // A token naming a common prefix means that whole group was listed.
        let skip = match (delimiter, params.continuation_token.as_deref()) {
            (Some(delim), Some(token)) => compute_common_prefix(token, params.prefix.as_deref(), delim)
                .filter(|group| group == token),
            _ => None,
        };
        let skip = skip.as_deref();
        let pool = self.ctx.store.pool();

        let rows = self
            .ctx
            .store
            .retry(move || async move {
                versions::visible_objects(pool, bucket_id, prefix, after, skip, fetch_limit as i64)
                    .await
            })
            .await?;
        let more_rows = rows.len() == fetch_limit;

        let mut objects = Vec::new();
        let mut common_prefixes: Vec<String> = Vec::new();
        let mut last_key = None;
        let mut is_truncated = false;
        for row in rows {
            let group = delimiter
                .and_then(|delim| compute_common_prefix(&row.name, params.prefix.as_deref(), delim));
            if let Some(group) = &group {
                if common_prefixes.last() == Some(group) {
                    continue;
                }
            }
            if objects.len() + common_prefixes.len() == max_keys {
                is_truncated = true;
                break;
            }
            match group {
                Some(group) => {
                    last_key = Some(group.clone());
                    common_prefixes.push(group);
                }
                None => {
                    last_key = Some(row.name.clone());
                    objects.push(row);
                }
            }
        }
        // A full fetch leaves rows past this page even when groups absorbed it.
        is_truncated |= more_rows;
        let next_continuation_token = if is_truncated { last_key } else { None };

        let key_count = objects.len() + common_prefixes.len();
        Ok(ListObjectsResult {
            objects,
            common_prefixes,
            is_truncated,
            next_continuation_token,
            key_count,
        })
    }

    /// All committed versions, delete markers included, by name and newest
    /// first.
    pub async fn list_versions(
        &self,
        params: &ListVersionsParams,
    ) -> StorageResult<ListVersionsResult> {
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;
        let bucket_id = self.id();
        let prefix = params.prefix.as_deref().unwrap_or("");
        let marker = params.marker.as_ref();
        let pool = self.ctx.store.pool();

        let mut versions = self
            .ctx
            .store
            .retry(move || async move {
                versions::committed_versions(pool, bucket_id, prefix, marker, fetch_limit as i64)
                    .await
            })
            .await?;

        let is_truncated = versions.len() == fetch_limit;
        if is_truncated {
            versions.pop();
        }
        let next_marker = is_truncated
            .then(|| versions.last())
            .flatten()
            .map(|entry| VersionMarker {
                name: entry.name.clone(),
                commit_time: entry.version.commit_time,
                id: entry.version.id,
            });
        Ok(ListVersionsResult {
            versions,
            is_truncated,
            next_marker,
        })
    }
}

pub(crate) fn new_version_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Used only when a delimiter is provided. Returns Some(prefix) if the key
/// belongs to a grouped prefix, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::from(requested_prefix.unwrap_or(""));
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::compute_common_prefix;

    #[test]
    fn common_prefix_groups_after_requested_prefix() {
        assert_eq!(
            compute_common_prefix("photos/2025/a.jpg", Some("photos/"), "/"),
            Some("photos/2025/".to_string())
        );
        assert_eq!(compute_common_prefix("photos/a.jpg", Some("photos/"), "/"), None);
        assert_eq!(
            compute_common_prefix("docs/x", None, "/"),
            Some("docs/".to_string())
        );
    }
}
