//! `buckets` table.

use super::error::StorageResult;
use crate::models::{
    bucket::{Bucket, BucketStats},
    object::{ObjectState, VersionType},
};
use sqlx::SqliteExecutor;
use uuid::Uuid;

const BUCKET_COLUMNS: &str = "id, name, owner_id, placement_name, placement_storage_class, \
     created_at, versioning_enabled, deleted, attrs";

pub async fn insert_bucket(db: impl SqliteExecutor<'_>, bucket: &Bucket) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO buckets (id, name, owner_id, placement_name, placement_storage_class,
                              created_at, versioning_enabled, deleted, attrs)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(bucket.id)
    .bind(&bucket.name)
    .bind(&bucket.owner_id)
    .bind(&bucket.placement_name)
    .bind(&bucket.placement_storage_class)
    .bind(bucket.created_at)
    .bind(bucket.versioning_enabled)
    .bind(bucket.deleted)
    .bind(&bucket.attrs)
    .execute(db)
    .await?;
    Ok(())
}

/// The live (not soft-deleted) bucket called `name`.
pub async fn get_live_by_name(
    db: impl SqliteExecutor<'_>,
    name: &str,
) -> StorageResult<Option<Bucket>> {
    let bucket = sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets WHERE name = ? AND deleted = 0"
    ))
    .bind(name)
    .fetch_optional(db)
    .await?;
    Ok(bucket)
}

pub async fn get_by_id(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<Option<Bucket>> {
    let bucket = sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(bucket)
}

pub async fn list_live(
    db: impl SqliteExecutor<'_>,
    owner_id: Option<&str>,
) -> StorageResult<Vec<Bucket>> {
    let buckets = sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets
         WHERE deleted = 0 AND (?1 IS NULL OR owner_id = ?1)
         ORDER BY name ASC"
    ))
    .bind(owner_id)
    .fetch_all(db)
    .await?;
    Ok(buckets)
}

pub async fn list_deleted(db: impl SqliteExecutor<'_>) -> StorageResult<Vec<Bucket>> {
    let buckets = sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets WHERE deleted = 1 ORDER BY created_at ASC"
    ))
    .fetch_all(db)
    .await?;
    Ok(buckets)
}

pub async fn set_versioning(
    db: impl SqliteExecutor<'_>,
    id: Uuid,
    enabled: bool,
) -> StorageResult<u64> {
    let res = sqlx::query("UPDATE buckets SET versioning_enabled = ? WHERE id = ? AND deleted = 0")
        .bind(enabled)
        .bind(id)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

pub async fn mark_deleted(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<u64> {
    let res = sqlx::query("UPDATE buckets SET deleted = 1 WHERE id = ? AND deleted = 0")
        .bind(id)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

/// Physically remove a soft-deleted bucket with no children left.
pub async fn remove_if_empty(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<u64> {
    let res = sqlx::query(
        "DELETE FROM buckets
         WHERE id = ?1 AND deleted = 1
           AND NOT EXISTS (SELECT 1 FROM objects WHERE bucket_id = ?1)
           AND NOT EXISTS (SELECT 1 FROM multiparts WHERE bucket_id = ?1)",
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// True while any object's newest committed version is a regular one.
pub async fn has_visible_objects(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT EXISTS (
             SELECT 1 FROM objects o JOIN versions v ON v.object_id = o.uuid
             WHERE o.bucket_id = ?1
               AND v.version_type = ?2
               AND v.id = (SELECT v2.id FROM versions v2
                           WHERE v2.object_id = o.uuid AND v2.object_state = ?3
                           ORDER BY v2.commit_time DESC, v2.id DESC LIMIT 1))",
    )
    .bind(id)
    .bind(VersionType::Regular)
    .bind(ObjectState::Committed)
    .fetch_one(db)
    .await?;
    Ok(found != 0)
}

pub async fn stats(db: impl SqliteExecutor<'_>, id: Uuid) -> StorageResult<BucketStats> {
    let (object_count, size) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COUNT(DISTINCT v.object_id), COALESCE(SUM(v.size), 0)
         FROM versions v JOIN objects o ON o.uuid = v.object_id
         WHERE o.bucket_id = ? AND v.object_state = ? AND v.version_type = ?",
    )
    .bind(id)
    .bind(ObjectState::Committed)
    .bind(VersionType::Regular)
    .fetch_one(db)
    .await?;
    Ok(BucketStats { object_count, size })
}
