//! Multipart upload engine.
//!
//! ```text
//! NONE -> INIT -> INPROGRESS -> COMPLETE -> AGGREGATING -> DONE
//!           \________\______________\___________\--> ABORTED
//! ```
//!
//! Parts are written to their own files and only concatenated into the
//! destination version on completion. Part rows and files of a DONE upload
//! are removed right away; those of an ABORTED upload are left to the
//! garbage collector.

use crate::{
    models::{
        bucket::Placement,
        multipart::{MultipartPart, MultipartState, MultipartUpload},
        object::Attrs,
        time::Timestamp,
    },
    services::{
        bucket::BucketHandle,
        ops::{PayloadFile, Writer},
        storage_service::ensure_key_safe,
        version::CommitInfo,
    },
    store::{
        error::{StorageError, StorageResult, is_unique_violation},
        multipart as mp, paths,
    },
};
use md5::Context;
use sqlx::types::Json;
use std::{collections::HashMap, io, path::Path, sync::Arc};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_PARTS: usize = 10_000;
const MAX_PART_NUM: i64 = 10_000;
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Upload attribute keys recording the result of a completed upload, so a
/// repeated completion can answer without the parts.
const COMPLETED_ETAG_ATTR: &str = "sfs.multipart.etag";
const COMPLETED_VERSION_ATTR: &str = "sfs.multipart.version-id";
const COMPLETED_SIZE_ATTR: &str = "sfs.multipart.size";

/// Cached view of an upload's immutable fields.
#[derive(Debug)]
pub struct MultipartUploadHandle {
    upload: MultipartUpload,
}

impl MultipartUploadHandle {
    pub fn upload(&self) -> &MultipartUpload {
        &self.upload
    }

    pub fn upload_id(&self) -> &str {
        &self.upload.upload_id
    }

    pub fn object_name(&self) -> &str {
        &self.upload.object_name
    }
}

#[derive(Clone, Debug, Default)]
pub struct InitMultipart {
    pub object_name: String,
    /// Generated when not given.
    pub upload_id: Option<String>,
    pub owner_id: String,
    pub owner_display_name: String,
    pub attrs: Attrs,
    pub placement: Placement,
}

#[derive(Clone, Debug, Default)]
pub struct ListMultipartsParams {
    pub prefix: Option<String>,
    /// Listing key of the last upload already seen.
    pub marker: Option<String>,
    pub max_uploads: usize,
}

#[derive(Debug)]
pub struct ListMultipartsResult {
    pub uploads: Vec<MultipartUpload>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

#[derive(Debug)]
pub struct ListPartsResult {
    pub parts: Vec<MultipartPart>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<i64>,
}

/// Part number and etag as sent by the client on completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_num: i64,
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_num: i64, etag: impl Into<String>) -> Self {
        Self {
            part_num,
            etag: etag.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteResult {
    pub etag: String,
    pub version_id: String,
    pub size: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartWriteResult {
    pub part_num: i64,
    pub etag: String,
    pub size: i64,
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// `md5(md5(part1) || md5(part2) || ...)-N` over the binary part digests.
pub fn multipart_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> StorageResult<String> {
    let mut digest = Context::new();
    let mut count = 0;
    for etag in part_etags {
        let raw = hex::decode(strip_quotes(etag)).map_err(|_| StorageError::InvalidPart {
            part_num: count + 1,
            reason: format!("etag `{}` is not a hex digest", etag),
        })?;
        digest.consume(&raw);
        count += 1;
    }
    Ok(format!("{:x}-{}", digest.compute(), count))
}

impl BucketHandle {
    fn no_such_upload(upload_id: &str) -> StorageError {
        StorageError::NoSuchUpload(upload_id.to_string())
    }

    /// Start a multipart upload in state INIT.
    pub async fn init_multipart(
        &self,
        req: InitMultipart,
    ) -> StorageResult<Arc<MultipartUploadHandle>> {
        ensure_key_safe(&req.object_name)?;
        let upload_id = req
            .upload_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = Timestamp::now();
        let mut upload = MultipartUpload {
            id: 0,
            bucket_id: self.id(),
            meta_str: MultipartUpload::meta_str_for(&req.object_name, &upload_id),
            upload_id,
            state: MultipartState::Init,
            state_change_time: now,
            object_name: req.object_name,
            object_uuid: Uuid::new_v4(),
            owner_id: req.owner_id,
            owner_display_name: req.owner_display_name,
            mtime: now,
            attrs: Json(req.attrs),
            placement_name: req.placement.name,
            placement_storage_class: req.placement.storage_class,
        };

        let ctx = self.context();
        let pool = ctx.store.pool();
        let row = &upload;
        let id = ctx
            .store
            .write(move || async move {
                match mp::insert_upload(pool, row).await {
                    Err(StorageError::Sqlx(err)) if is_unique_violation(&err) => {
                        Err(StorageError::UploadAlreadyExists(row.upload_id.clone()))
                    }
                    other => other,
                }
            })
            .await?;
        upload.id = id;
        info!(
            "multipart upload {} started for {}",
            upload.upload_id, upload.object_name
        );

        let handle = Arc::new(MultipartUploadHandle { upload });
        self.uploads
            .lock()
            .insert(handle.upload.upload_id.clone(), handle.clone());
        Ok(handle)
    }

    async fn load_upload(&self, upload_id: &str) -> StorageResult<Option<MultipartUpload>> {
        let ctx = self.context();
        let pool = ctx.store.pool();
        let bucket_id = self.id();
        let upload = ctx
            .store
            .retry(move || async move { mp::get_upload(pool, upload_id).await })
            .await?;
        Ok(upload.filter(|u| u.bucket_id == bucket_id))
    }

    /// Handle of an upload that is still in flight (INIT or INPROGRESS).
    pub async fn get_multipart(&self, upload_id: &str) -> StorageResult<Arc<MultipartUploadHandle>> {
        let upload = self
            .load_upload(upload_id)
            .await?
            .filter(MultipartUpload::is_available)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let mut uploads = self.uploads.lock();
        let handle = uploads
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(MultipartUploadHandle { upload }));
        Ok(handle.clone())
    }

    /// Current row of an in-flight upload.
    pub async fn multipart_info(&self, upload_id: &str) -> StorageResult<MultipartUpload> {
        self.load_upload(upload_id)
            .await?
            .filter(MultipartUpload::is_available)
            .ok_or_else(|| Self::no_such_upload(upload_id))
    }

    /// Writer for part `part_num` of `upload_id`.
    pub fn part_writer(self: &Arc<Self>, upload_id: &str, part_num: i64) -> PartWriter {
        PartWriter {
            bucket: self.clone(),
            upload_id: upload_id.to_string(),
            part_num,
            file: None,
        }
    }

    /// In-flight uploads ordered by their listing key.
    pub async fn list_multiparts(
        &self,
        params: &ListMultipartsParams,
    ) -> StorageResult<ListMultipartsResult> {
        let max_uploads = params.max_uploads.clamp(1, 1000);
        let fetch_limit = max_uploads + 1;
        let bucket_id = self.id();
        let prefix = params.prefix.as_deref().unwrap_or("");
        let marker = params.marker.as_deref().unwrap_or("");
        let ctx = self.context();
        let pool = ctx.store.pool();
        let mut uploads = ctx
            .store
            .retry(move || async move {
                mp::list_in_flight(pool, bucket_id, prefix, marker, fetch_limit as i64).await
            })
            .await?;
        let is_truncated = uploads.len() == fetch_limit;
        if is_truncated {
            uploads.pop();
        }
        let next_marker = is_truncated
            .then(|| uploads.last().map(|u| u.meta_str.clone()))
            .flatten();
        Ok(ListMultipartsResult {
            uploads,
            is_truncated,
            next_marker,
        })
    }

    /// Finished parts of an in-flight upload with a number above `marker`.
    pub async fn list_parts(
        &self,
        upload_id: &str,
        marker: i64,
        max_parts: usize,
    ) -> StorageResult<ListPartsResult> {
        self.multipart_info(upload_id).await?;
        let max_parts = max_parts.clamp(1, MAX_PARTS);
        let fetch_limit = max_parts + 1;
        let ctx = self.context();
        let pool = ctx.store.pool();
        let mut parts = ctx
            .store
            .retry(move || async move {
                mp::list_finished_parts(pool, upload_id, marker, fetch_limit as i64).await
            })
            .await?;
        let is_truncated = parts.len() == fetch_limit;
        if is_truncated {
            parts.pop();
        }
        let next_part_number_marker = is_truncated.then(|| parts.last().map(|p| p.part_num)).flatten();
        Ok(ListPartsResult {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// Check the client's part list against the stored parts. Touches
    /// nothing.
    async fn validate_completion(
        &self,
        upload: &MultipartUpload,
        requested: &[CompletedPart],
    ) -> StorageResult<Vec<MultipartPart>> {
        let invalid = |part_num: i64, reason: &str| StorageError::InvalidPart {
            part_num,
            reason: reason.to_string(),
        };
        if requested.is_empty() {
            return Err(invalid(0, "no parts given"));
        }
        if requested.len() > MAX_PARTS {
            return Err(invalid(0, "too many parts"));
        }
        if requested.windows(2).any(|w| w[0].part_num >= w[1].part_num) {
            return Err(invalid(0, "parts must be listed in ascending order"));
        }

        let ctx = self.context();
        let pool = ctx.store.pool();
        let upload_id = upload.upload_id.as_str();
        let stored = ctx
            .store
            .retry(move || async move { mp::all_parts(pool, upload_id).await })
            .await?;
        if stored.len() != requested.len() {
            return Err(invalid(
                0,
                &format!(
                    "{} parts given but {} uploaded",
                    requested.len(),
                    stored.len()
                ),
            ));
        }

        let by_num: HashMap<i64, &MultipartPart> =
            stored.iter().map(|p| (p.part_num, p)).collect();
        let min_size = ctx.config.multipart_min_part_size as i64;
        let last = requested.len() - 1;
        for (idx, req) in requested.iter().enumerate() {
            let part = by_num
                .get(&req.part_num)
                .ok_or_else(|| invalid(req.part_num, "part was not uploaded"))?;
            let Some(stored_etag) = part.etag.as_deref() else {
                return Err(invalid(req.part_num, "part is not finished"));
            };
            if strip_quotes(stored_etag) != strip_quotes(&req.etag) {
                return Err(invalid(req.part_num, "etag mismatch"));
            }
            if idx != last && part.size < min_size {
                return Err(StorageError::PartTooSmall {
                    part_num: req.part_num,
                });
            }
            let path = ctx.payload_path(paths::part_path(&upload.object_uuid, part.part_num));
            let on_disk = fs::metadata(&path)
                .await
                .map_err(|_| invalid(req.part_num, "part payload missing"))?
                .len();
            if on_disk != part.size as u64 {
                return Err(invalid(req.part_num, "part payload size mismatch"));
            }
        }

        ctx.ensure_free_space()?;
        let mut ordered = stored;
        ordered.sort_by_key(|p| p.part_num);
        Ok(ordered)
    }

    /// Complete an upload: validate, concatenate the parts in ascending
    /// order into a new version of the target object, commit it and drop
    /// the parts.
    ///
    /// Any validation failure leaves the upload and its parts untouched.
    /// Completing an upload that is already DONE succeeds again.
    pub async fn complete_multipart(
        self: &Arc<Self>,
        upload_id: &str,
        requested: &[CompletedPart],
    ) -> StorageResult<CompleteResult> {
        let upload = self
            .load_upload(upload_id)
            .await?
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        if upload.state == MultipartState::Done {
            return completed_result(&upload);
        }
        if !upload.is_available() {
            return Err(Self::no_such_upload(upload_id));
        }

        let parts = self.validate_completion(&upload, requested).await?;

        let ctx = self.context().clone();
        let pool = ctx.store.pool();
        let moved = ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                let from = mp::get_upload(&mut *tx, upload_id)
                    .await?
                    .map(|u| u.state)
                    .filter(|s| matches!(s, MultipartState::Init | MultipartState::InProgress));
                let Some(from) = from else {
                    return Ok(false);
                };
                if mp::transition(&mut *tx, upload_id, from, MultipartState::Complete).await? == 0 {
                    return Ok(false);
                }
                mp::transition(
                    &mut *tx,
                    upload_id,
                    MultipartState::Complete,
                    MultipartState::Aggregating,
                )
                .await?;
                tx.commit().await?;
                Ok(true)
            })
            .await?;
        if !moved {
            // Lost a race against another completion or an abort.
            return match self.load_upload(upload_id).await? {
                Some(u) if u.state == MultipartState::Done => completed_result(&u),
                _ => Err(Self::no_such_upload(upload_id)),
            };
        }

        let etag = multipart_etag(parts.iter().filter_map(|p| p.etag.as_deref()))?;
        let mut version = self.create_version(&upload.object_name, None).await?;
        *version.attrs_mut() = upload.attrs.0.clone();

        let tmp = ctx.payload_path(paths::aggregate_path(&upload.object_uuid));
        let published = async {
            let (size, checksum) =
                aggregate_parts(ctx.base_path.as_path(), &upload, &parts, &tmp).await?;
            let dest = version.path();
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&tmp, &dest).await?;
            let committed = version
                .commit(CommitInfo {
                    size,
                    etag: etag.clone(),
                    checksum,
                })
                .await?;
            if !committed {
                return Err(StorageError::CommitConflict(upload.object_name.clone()));
            }
            Ok(size)
        }
        .await;
        let size = match published {
            Ok(size) => size,
            Err(err) => {
                // The new version never became visible; GC reclaims its payload.
                let _ = fs::remove_file(&tmp).await;
                if let Err(cleanup) = version.mark_deleted().await {
                    warn!(
                        "could not discard version of {} after failed completion: {}",
                        upload.object_name, cleanup
                    );
                }
                return Err(err);
            }
        };

        let mut done_attrs = upload.attrs.0.clone();
        done_attrs.insert(COMPLETED_ETAG_ATTR.into(), etag.clone().into_bytes());
        done_attrs.insert(
            COMPLETED_VERSION_ATTR.into(),
            version.version_id().as_bytes().to_vec(),
        );
        done_attrs.insert(COMPLETED_SIZE_ATTR.into(), size.to_string().into_bytes());
        let done_attrs = Json(done_attrs);
        let done_attrs = &done_attrs;
        ctx.store
            .write(move || async move { mp::mark_done(pool, upload_id, done_attrs).await })
            .await?;

        self.remove_parts(&upload, &parts).await?;
        self.uploads.lock().remove(upload_id);
        info!(
            "multipart upload {} completed into {} ({} parts, {} bytes)",
            upload_id,
            upload.object_name,
            parts.len(),
            size
        );
        Ok(CompleteResult {
            etag,
            version_id: version.version_id().to_string(),
            size,
        })
    }

    async fn remove_parts(
        &self,
        upload: &MultipartUpload,
        parts: &[MultipartPart],
    ) -> StorageResult<()> {
        let ctx = self.context();
        for part in parts {
            let path = ctx.payload_path(paths::part_path(&upload.object_uuid, part.part_num));
            remove_payload(&path).await;
        }
        let pool = ctx.store.pool();
        let upload_id = upload.upload_id.as_str();
        ctx.store
            .write(move || async move { mp::remove_parts(pool, upload_id).await })
            .await?;
        let dir = ctx.payload_path(paths::object_dir(&upload.object_uuid));
        paths::prune_empty_dirs(&dir, &ctx.base_path).await;
        Ok(())
    }

    /// Abort an upload that has not reached DONE. Its parts are reclaimed by
    /// the garbage collector.
    pub async fn abort_multipart(&self, upload_id: &str) -> StorageResult<()> {
        if self.load_upload(upload_id).await?.is_none() {
            return Err(Self::no_such_upload(upload_id));
        }
        let ctx = self.context();
        let pool = ctx.store.pool();
        let rows = ctx
            .store
            .write(move || async move { mp::abort(pool, upload_id).await })
            .await?;
        self.uploads.lock().remove(upload_id);
        if rows == 0 {
            return Err(Self::no_such_upload(upload_id));
        }
        debug!("multipart upload {} aborted", upload_id);
        Ok(())
    }

    /// Abort every upload of this bucket that has not reached DONE.
    pub async fn abort_all_multiparts(&self) -> StorageResult<u64> {
        let ctx = self.context();
        let pool = ctx.store.pool();
        let bucket_id = self.id();
        let rows = ctx
            .store
            .write(move || async move { mp::abort_all_of_bucket(pool, bucket_id).await })
            .await?;
        self.uploads.lock().clear();
        Ok(rows)
    }
}

fn completed_result(upload: &MultipartUpload) -> StorageResult<CompleteResult> {
    let attr = |key: &str| {
        upload
            .attrs
            .0
            .get(key)
            .and_then(|v| String::from_utf8(v.clone()).ok())
    };
    match (attr(COMPLETED_ETAG_ATTR), attr(COMPLETED_VERSION_ATTR)) {
        (Some(etag), Some(version_id)) => Ok(CompleteResult {
            etag,
            version_id,
            size: attr(COMPLETED_SIZE_ATTR)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        }),
        _ => Err(StorageError::Inconsistency(format!(
            "upload {} is done but carries no completion record",
            upload.upload_id
        ))),
    }
}

async fn remove_payload(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

/// Concatenate the part files into `dest`, checking each part against its
/// recorded size. Returns the total size and the md5 of the whole payload.
async fn aggregate_parts(
    base: &Path,
    upload: &MultipartUpload,
    parts: &[MultipartPart],
    dest: &Path,
) -> StorageResult<(i64, String)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut out = File::create(dest).await?;
    let mut digest = Context::new();
    let mut total: i64 = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    for part in parts {
        let path = base.join(paths::part_path(&upload.object_uuid, part.part_num));
        let mut file = File::open(&path).await?;
        let mut copied: i64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            digest.consume(&buf[..n]);
            copied += n as i64;
        }
        if copied != part.size {
            return Err(StorageError::InvalidPart {
                part_num: part.part_num,
                reason: format!("expected {} bytes, read {}", part.size, copied),
            });
        }
        total += copied;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok((total, format!("{:x}", digest.compute())))
}

/// Writes one part of a multipart upload.
pub struct PartWriter {
    bucket: Arc<BucketHandle>,
    upload_id: String,
    part_num: i64,
    file: Option<PayloadFile>,
}

impl Writer for PartWriter {
    type Output = PartWriteResult;

    /// Obtain (or reset) the part and move the upload to INPROGRESS.
    async fn prepare(&mut self) -> StorageResult<()> {
        if !(1..=MAX_PART_NUM).contains(&self.part_num) {
            return Err(StorageError::InvalidPart {
                part_num: self.part_num,
                reason: format!("part numbers run from 1 to {}", MAX_PART_NUM),
            });
        }
        let ctx = self.bucket.context();
        ctx.ensure_free_space()?;
        let pool = ctx.store.pool();
        let upload_id = self.upload_id.as_str();
        let part_num = self.part_num;
        let bucket_id = self.bucket.id();
        let object_uuid = ctx
            .store
            .write(move || async move {
                let mut tx = pool.begin().await?;
                let upload = mp::get_upload(&mut *tx, upload_id)
                    .await?
                    .filter(|u| u.bucket_id == bucket_id && u.is_available())
                    .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;
                if upload.state == MultipartState::Init {
                    mp::transition(
                        &mut *tx,
                        upload_id,
                        MultipartState::Init,
                        MultipartState::InProgress,
                    )
                    .await?;
                }
                mp::upsert_unfinished_part(&mut *tx, upload_id, part_num).await?;
                tx.commit().await?;
                Ok(upload.object_uuid)
            })
            .await?;
        let path = ctx.payload_path(paths::part_path(&object_uuid, part_num));
        self.file = Some(PayloadFile::create(path).await?);
        Ok(())
    }

    async fn process(&mut self, data: &[u8]) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StorageError::Io(io::Error::other("part writer used before prepare"))
        })?;
        file.write(data).await
    }

    /// Record size and etag. A part can only be finished once; write it
    /// again to replace it.
    async fn complete(mut self) -> StorageResult<PartWriteResult> {
        let file = self.file.take().ok_or_else(|| {
            StorageError::Io(io::Error::other("part writer used before prepare"))
        })?;
        let (size, etag) = file.finish().await?;
        let ctx = self.bucket.context();
        let pool = ctx.store.pool();
        let upload_id = self.upload_id.as_str();
        let part_num = self.part_num;
        let etag_ref = etag.as_str();
        let rows = ctx
            .store
            .write(move || async move {
                mp::finish_part(pool, upload_id, part_num, size, etag_ref).await
            })
            .await?;
        if rows == 0 {
            return Err(StorageError::InvalidPart {
                part_num,
                reason: "part already finished".into(),
            });
        }
        Ok(PartWriteResult {
            part_num,
            etag,
            size,
        })
    }

    async fn abort(mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.discard().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_etag_hashes_binary_digests() {
        let e1 = format!("{:x}", md5::compute(b"hello "));
        let e2 = format!("{:x}", md5::compute(b"world"));
        let mut concat = hex::decode(&e1).unwrap();
        concat.extend(hex::decode(&e2).unwrap());
        let expected = format!("{:x}-2", md5::compute(&concat));
        let quoted = format!("\"{}\"", e2);
        assert_eq!(multipart_etag([e1.as_str(), quoted.as_str()]).unwrap(), expected);
    }

    #[test]
    fn multipart_etag_rejects_non_hex() {
        assert!(matches!(
            multipart_etag(["zz"]),
            Err(StorageError::InvalidPart { part_num: 1, .. })
        ));
    }
}
