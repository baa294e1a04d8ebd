//! `multiparts` and `multipart_parts` tables.

use super::error::StorageResult;
use crate::models::{
    multipart::{MultipartPart, MultipartState, MultipartUpload},
    object::Attrs,
    time::Timestamp,
};
use sqlx::{SqliteExecutor, types::Json};
use uuid::Uuid;

const UPLOAD_COLUMNS: &str = "id, bucket_id, upload_id, state, state_change_time, object_name, \
     object_uuid, meta_str, owner_id, owner_display_name, mtime, attrs, placement_name, \
     placement_storage_class";

const PART_COLUMNS: &str = "id, upload_id, part_num, size, etag, mtime";

pub async fn insert_upload(
    db: impl SqliteExecutor<'_>,
    upload: &MultipartUpload,
) -> StorageResult<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO multiparts (bucket_id, upload_id, state, state_change_time, object_name,
                                 object_uuid, meta_str, owner_id, owner_display_name, mtime,
                                 attrs, placement_name, placement_storage_class)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(upload.bucket_id)
    .bind(&upload.upload_id)
    .bind(upload.state)
    .bind(upload.state_change_time)
    .bind(&upload.object_name)
    .bind(upload.object_uuid)
    .bind(&upload.meta_str)
    .bind(&upload.owner_id)
    .bind(&upload.owner_display_name)
    .bind(upload.mtime)
    .bind(&upload.attrs)
    .bind(&upload.placement_name)
    .bind(&upload.placement_storage_class)
    .fetch_one(db)
    .await?;
    Ok(id)
}

pub async fn get_upload(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
) -> StorageResult<Option<MultipartUpload>> {
    let upload = sqlx::query_as::<_, MultipartUpload>(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM multiparts WHERE upload_id = ?"
    ))
    .bind(upload_id)
    .fetch_optional(db)
    .await?;
    Ok(upload)
}

/// Move the upload to `to` if it currently is in `from`.
pub async fn transition(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    from: MultipartState,
    to: MultipartState,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE multiparts SET state = ?, state_change_time = ? WHERE upload_id = ? AND state = ?",
    )
    .bind(to)
    .bind(Timestamp::now())
    .bind(upload_id)
    .bind(from)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// AGGREGATING -> DONE, recording the completion attributes.
pub async fn mark_done(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    attrs: &Json<Attrs>,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE multiparts SET state = ?, state_change_time = ?, attrs = ?
         WHERE upload_id = ? AND state = ?",
    )
    .bind(MultipartState::Done)
    .bind(Timestamp::now())
    .bind(attrs)
    .bind(upload_id)
    .bind(MultipartState::Aggregating)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// Any state from INIT up to, but excluding, DONE -> ABORTED.
pub async fn abort(db: impl SqliteExecutor<'_>, upload_id: &str) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE multiparts SET state = ?, state_change_time = ?
         WHERE upload_id = ? AND state >= ? AND state < ?",
    )
    .bind(MultipartState::Aborted)
    .bind(Timestamp::now())
    .bind(upload_id)
    .bind(MultipartState::Init)
    .bind(MultipartState::Done)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

pub async fn abort_all_of_bucket(db: impl SqliteExecutor<'_>, bucket_id: Uuid) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE multiparts SET state = ?, state_change_time = ?
         WHERE bucket_id = ? AND state >= ? AND state < ?",
    )
    .bind(MultipartState::Aborted)
    .bind(Timestamp::now())
    .bind(bucket_id)
    .bind(MultipartState::Init)
    .bind(MultipartState::Done)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// In-flight uploads (INIT or INPROGRESS) ordered by their listing key.
pub async fn list_in_flight(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
    prefix: &str,
    marker: &str,
    limit: i64,
) -> StorageResult<Vec<MultipartUpload>> {
    let uploads = sqlx::query_as::<_, MultipartUpload>(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM multiparts
         WHERE bucket_id = ? AND state >= ? AND state <= ?
           AND meta_str > ?
           AND substr(object_name, 1, length(?)) = ?
         ORDER BY meta_str ASC
         LIMIT ?"
    ))
    .bind(bucket_id)
    .bind(MultipartState::Init)
    .bind(MultipartState::InProgress)
    .bind(marker)
    .bind(prefix)
    .bind(prefix)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(uploads)
}

/// DONE or ABORTED uploads, any bucket.
pub async fn list_finished(db: impl SqliteExecutor<'_>, limit: i64) -> StorageResult<Vec<MultipartUpload>> {
    let uploads = sqlx::query_as::<_, MultipartUpload>(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM multiparts
         WHERE state IN (?, ?)
         ORDER BY id ASC
         LIMIT ?"
    ))
    .bind(MultipartState::Done)
    .bind(MultipartState::Aborted)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(uploads)
}

pub async fn uploads_of_bucket(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
) -> StorageResult<Vec<MultipartUpload>> {
    let uploads = sqlx::query_as::<_, MultipartUpload>(&format!(
        "SELECT {UPLOAD_COLUMNS} FROM multiparts WHERE bucket_id = ? ORDER BY id ASC"
    ))
    .bind(bucket_id)
    .fetch_all(db)
    .await?;
    Ok(uploads)
}

pub async fn remove_upload_if_no_parts(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "DELETE FROM multiparts
         WHERE upload_id = ?1
           AND NOT EXISTS (SELECT 1 FROM multipart_parts WHERE upload_id = ?1)",
    )
    .bind(upload_id)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

pub async fn get_part(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    part_num: i64,
) -> StorageResult<Option<MultipartPart>> {
    let part = sqlx::query_as::<_, MultipartPart>(&format!(
        "SELECT {PART_COLUMNS} FROM multipart_parts WHERE upload_id = ? AND part_num = ?"
    ))
    .bind(upload_id)
    .bind(part_num)
    .fetch_optional(db)
    .await?;
    Ok(part)
}

/// Insert an unfinished part, or reset an existing one back to unfinished.
pub async fn upsert_unfinished_part(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    part_num: i64,
) -> StorageResult<MultipartPart> {
    let part = sqlx::query_as::<_, MultipartPart>(&format!(
        "INSERT INTO multipart_parts (upload_id, part_num, size, etag, mtime)
         VALUES (?1, ?2, 0, NULL, ?3)
         ON CONFLICT (upload_id, part_num) DO UPDATE SET size = 0, etag = NULL, mtime = ?3
         RETURNING {PART_COLUMNS}"
    ))
    .bind(upload_id)
    .bind(part_num)
    .bind(Timestamp::now())
    .fetch_one(db)
    .await?;
    Ok(part)
}

/// Record size and etag of a part that has none yet.
pub async fn finish_part(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    part_num: i64,
    size: i64,
    etag: &str,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE multipart_parts SET size = ?, etag = ?, mtime = ?
         WHERE upload_id = ? AND part_num = ? AND etag IS NULL",
    )
    .bind(size)
    .bind(etag)
    .bind(Timestamp::now())
    .bind(upload_id)
    .bind(part_num)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// Finished parts with a number above `marker`, ascending.
pub async fn list_finished_parts(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
    marker: i64,
    limit: i64,
) -> StorageResult<Vec<MultipartPart>> {
    let parts = sqlx::query_as::<_, MultipartPart>(&format!(
        "SELECT {PART_COLUMNS} FROM multipart_parts
         WHERE upload_id = ? AND part_num > ? AND etag IS NOT NULL
         ORDER BY part_num ASC
         LIMIT ?"
    ))
    .bind(upload_id)
    .bind(marker)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(parts)
}

pub async fn all_parts(
    db: impl SqliteExecutor<'_>,
    upload_id: &str,
) -> StorageResult<Vec<MultipartPart>> {
    let parts = sqlx::query_as::<_, MultipartPart>(&format!(
        "SELECT {PART_COLUMNS} FROM multipart_parts WHERE upload_id = ? ORDER BY part_num ASC"
    ))
    .bind(upload_id)
    .fetch_all(db)
    .await?;
    Ok(parts)
}

pub async fn remove_part(db: impl SqliteExecutor<'_>, id: i64) -> StorageResult<u64> {
    let res = sqlx::query("DELETE FROM multipart_parts WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

pub async fn remove_parts(db: impl SqliteExecutor<'_>, upload_id: &str) -> StorageResult<u64> {
    let res = sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
        .bind(upload_id)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}
