//! `objects` and `versions` tables.

use super::error::StorageResult;
use crate::models::{
    object::{Attrs, NamedVersion, ObjectRow, ObjectState, Version, VersionEntry, VersionType},
    time::Timestamp,
};
use sqlx::{SqliteConnection, SqliteExecutor, types::Json};
use uuid::Uuid;

const VERSION_COLUMNS: &str = "v.id, v.object_id, v.checksum, v.size, v.create_time, \
     v.delete_time, v.commit_time, v.mtime, v.object_state, v.version_id, v.etag, v.attrs, \
     v.version_type";

/// Correlated subquery selecting the newest committed version of `o`.
/// Equal commit times are broken by the higher row id.
const LATEST_COMMITTED: &str = "(SELECT v2.id FROM versions v2
      WHERE v2.object_id = o.uuid AND v2.object_state = 1
      ORDER BY v2.commit_time DESC, v2.id DESC LIMIT 1)";

pub async fn find_object(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
    name: &str,
) -> StorageResult<Option<ObjectRow>> {
    let row = sqlx::query_as::<_, ObjectRow>(
        "SELECT uuid, bucket_id, name FROM objects WHERE bucket_id = ? AND name = ?",
    )
    .bind(bucket_id)
    .bind(name)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

/// The object row for `(bucket_id, name)`, created with a fresh UUID when
/// the name has not been seen in the bucket.
pub async fn get_or_insert_object(
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    name: &str,
) -> StorageResult<ObjectRow> {
    sqlx::query(
        "INSERT INTO objects (uuid, bucket_id, name) VALUES (?, ?, ?)
         ON CONFLICT (bucket_id, name) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(bucket_id)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    let row = sqlx::query_as::<_, ObjectRow>(
        "SELECT uuid, bucket_id, name FROM objects WHERE bucket_id = ? AND name = ?",
    )
    .bind(bucket_id)
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Insert `version` and return its row id.
pub async fn insert_version(db: impl SqliteExecutor<'_>, version: &Version) -> StorageResult<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO versions (object_id, checksum, size, create_time, delete_time, commit_time,
                               mtime, object_state, version_id, etag, attrs, version_type)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(version.object_id)
    .bind(&version.checksum)
    .bind(version.size)
    .bind(version.create_time)
    .bind(version.delete_time)
    .bind(version.commit_time)
    .bind(version.mtime)
    .bind(version.object_state)
    .bind(&version.version_id)
    .bind(&version.etag)
    .bind(&version.attrs)
    .bind(version.version_type)
    .fetch_one(db)
    .await?;
    Ok(id)
}

pub async fn get_version(db: impl SqliteExecutor<'_>, id: i64) -> StorageResult<Option<Version>> {
    let version = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions v WHERE v.id = ?"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(version)
}

pub async fn latest_committed(
    db: impl SqliteExecutor<'_>,
    object_id: Uuid,
) -> StorageResult<Option<Version>> {
    let version = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions v
         WHERE v.object_id = ? AND v.object_state = ?
         ORDER BY v.commit_time DESC, v.id DESC LIMIT 1"
    ))
    .bind(object_id)
    .bind(ObjectState::Committed)
    .fetch_optional(db)
    .await?;
    Ok(version)
}

/// Newest version with the given client version id, in any state but DELETED.
pub async fn by_version_id(
    db: impl SqliteExecutor<'_>,
    object_id: Uuid,
    version_id: &str,
) -> StorageResult<Option<Version>> {
    let version = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions v
         WHERE v.object_id = ? AND v.version_id = ? AND v.object_state != ?
         ORDER BY v.id DESC LIMIT 1"
    ))
    .bind(object_id)
    .bind(version_id)
    .bind(ObjectState::Deleted)
    .fetch_optional(db)
    .await?;
    Ok(version)
}

/// Newest version of the object in the given state.
pub async fn latest_in_state(
    db: impl SqliteExecutor<'_>,
    object_id: Uuid,
    state: ObjectState,
) -> StorageResult<Option<Version>> {
    let version = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions v
         WHERE v.object_id = ? AND v.object_state = ?
         ORDER BY v.id DESC LIMIT 1"
    ))
    .bind(object_id)
    .bind(state)
    .fetch_optional(db)
    .await?;
    Ok(version)
}

pub async fn versions_of_object(
    db: impl SqliteExecutor<'_>,
    object_id: Uuid,
) -> StorageResult<Vec<Version>> {
    let versions = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS} FROM versions v WHERE v.object_id = ? ORDER BY v.id ASC"
    ))
    .bind(object_id)
    .fetch_all(db)
    .await?;
    Ok(versions)
}

/// Payload-bearing fields written by a commit.
pub struct CommitFields<'a> {
    pub size: i64,
    pub checksum: &'a str,
    pub etag: &'a str,
    pub attrs: &'a Json<Attrs>,
    pub time: Timestamp,
}

/// OPEN -> COMMITTED. Zero rows affected means the version was not OPEN.
pub async fn commit_version(
    db: impl SqliteExecutor<'_>,
    id: i64,
    fields: &CommitFields<'_>,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE versions
         SET object_state = ?, commit_time = ?, mtime = ?, size = ?, checksum = ?, etag = ?,
             attrs = ?
         WHERE id = ? AND object_state = ?",
    )
    .bind(ObjectState::Committed)
    .bind(fields.time)
    .bind(fields.time)
    .bind(fields.size)
    .bind(fields.checksum)
    .bind(fields.etag)
    .bind(fields.attrs)
    .bind(id)
    .bind(ObjectState::Open)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// Soft-delete every COMMITTED version of the object except `keep_id`.
pub async fn delete_other_committed(
    db: impl SqliteExecutor<'_>,
    object_id: Uuid,
    keep_id: i64,
    now: Timestamp,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE versions SET object_state = ?, delete_time = ?
         WHERE object_id = ? AND id != ? AND object_state = ?",
    )
    .bind(ObjectState::Deleted)
    .bind(now)
    .bind(object_id)
    .bind(keep_id)
    .bind(ObjectState::Committed)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// OPEN or COMMITTED -> DELETED.
pub async fn mark_deleted(db: impl SqliteExecutor<'_>, id: i64, now: Timestamp) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE versions SET object_state = ?, delete_time = ? WHERE id = ? AND object_state != ?",
    )
    .bind(ObjectState::Deleted)
    .bind(now)
    .bind(id)
    .bind(ObjectState::Deleted)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// Metadata-only update; the state is left as is.
pub async fn update_attrs(
    db: impl SqliteExecutor<'_>,
    id: i64,
    attrs: &Json<Attrs>,
    mtime: Timestamp,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "UPDATE versions SET attrs = ?, mtime = ? WHERE id = ? AND object_state != ?",
    )
    .bind(attrs)
    .bind(mtime)
    .bind(id)
    .bind(ObjectState::Deleted)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

pub async fn remove_version(db: impl SqliteExecutor<'_>, id: i64) -> StorageResult<u64> {
    let res = sqlx::query("DELETE FROM versions WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

pub async fn remove_object_if_empty(db: impl SqliteExecutor<'_>, uuid: Uuid) -> StorageResult<u64> {
    let res = sqlx::query(
        "DELETE FROM objects
         WHERE uuid = ?1 AND NOT EXISTS (SELECT 1 FROM versions WHERE object_id = ?1)",
    )
    .bind(uuid)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}

/// Objects whose newest committed version is a regular one, ordered by name.
///
/// Names starting with `skip` are left out; a listing page that ended on a
/// common prefix resumes past the whole group this way.
pub async fn visible_objects(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
    prefix: &str,
    after: &str,
    skip: Option<&str>,
    limit: i64,
) -> StorageResult<Vec<NamedVersion>> {
    let rows = sqlx::query_as::<_, NamedVersion>(&format!(
        "SELECT o.name, o.bucket_id, {VERSION_COLUMNS}
         FROM objects o JOIN versions v ON v.object_id = o.uuid
         WHERE o.bucket_id = ?
           AND v.id = {LATEST_COMMITTED}
           AND v.version_type = ?
           AND substr(o.name, 1, length(?)) = ?
           AND o.name > ?
           AND (? IS NULL OR substr(o.name, 1, length(?)) <> ?)
         ORDER BY o.name ASC
         LIMIT ?"
    ))
    .bind(bucket_id)
    .bind(VersionType::Regular)
    .bind(prefix)
    .bind(prefix)
    .bind(after)
    .bind(skip)
    .bind(skip)
    .bind(skip)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Position inside a version listing: resume strictly after this row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMarker {
    pub name: String,
    pub commit_time: Timestamp,
    pub id: i64,
}

/// Every committed version (regular and delete markers), by name and then
/// newest first.
pub async fn committed_versions(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
    prefix: &str,
    marker: Option<&VersionMarker>,
    limit: i64,
) -> StorageResult<Vec<VersionEntry>> {
    let (name, commit_time, id) = match marker {
        Some(m) => (Some(m.name.as_str()), m.commit_time, m.id),
        None => (None, Timestamp::UNSET, 0),
    };
    let rows = sqlx::query_as::<_, VersionEntry>(&format!(
        "SELECT o.name, (v.id = {LATEST_COMMITTED}) AS is_latest, {VERSION_COLUMNS}
         FROM objects o JOIN versions v ON v.object_id = o.uuid
         WHERE o.bucket_id = ?1
           AND v.object_state = ?2
           AND substr(o.name, 1, length(?3)) = ?3
           AND (?4 IS NULL
                OR o.name > ?4
                OR (o.name = ?4 AND (v.commit_time < ?5
                                     OR (v.commit_time = ?5 AND v.id < ?6))))
         ORDER BY o.name ASC, v.commit_time DESC, v.id DESC
         LIMIT ?7"
    ))
    .bind(bucket_id)
    .bind(ObjectState::Committed)
    .bind(prefix)
    .bind(name)
    .bind(commit_time)
    .bind(id)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// DELETED versions outside soft-deleted buckets, oldest first.
pub async fn deleted_versions(db: impl SqliteExecutor<'_>, limit: i64) -> StorageResult<Vec<Version>> {
    let rows = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS}
         FROM versions v JOIN objects o ON o.uuid = v.object_id
         JOIN buckets b ON b.id = o.bucket_id
         WHERE v.object_state = ? AND b.deleted = 0
         ORDER BY v.id ASC
         LIMIT ?"
    ))
    .bind(ObjectState::Deleted)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Any versions of a bucket, regardless of state.
pub async fn versions_of_bucket(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
    limit: i64,
) -> StorageResult<Vec<Version>> {
    let rows = sqlx::query_as::<_, Version>(&format!(
        "SELECT {VERSION_COLUMNS}
         FROM versions v JOIN objects o ON o.uuid = v.object_id
         WHERE o.bucket_id = ?
         ORDER BY v.id ASC
         LIMIT ?"
    ))
    .bind(bucket_id)
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Drop the object rows of a bucket that no longer have versions.
pub async fn remove_empty_objects_of_bucket(
    db: impl SqliteExecutor<'_>,
    bucket_id: Uuid,
) -> StorageResult<u64> {
    let res = sqlx::query(
        "DELETE FROM objects
         WHERE bucket_id = ? AND NOT EXISTS (SELECT 1 FROM versions WHERE object_id = objects.uuid)",
    )
    .bind(bucket_id)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}
