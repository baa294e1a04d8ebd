//! HTTP handlers for bucket and object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService` and the bucket handles it hands out.

use crate::{
    errors::AppError,
    handlers::multipart_handlers::{list_multiparts, list_parts, upload_part},
    models::{
        bucket::{Bucket, BucketStats, Placement},
        object::{Attrs, NamedVersion, ObjectKey, VersionEntry},
        time::Timestamp,
        user::User,
    },
    services::{
        bucket::{DeleteResult, ListObjectsParams, ListVersionsParams},
        ops::{DeleteOp, ObjectDeleter, ObjectReader, ObjectWriter, ReadOp, write_stream},
        storage_service::StorageService,
        version::ObjectVersion,
    },
    store::versions::VersionMarker,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

pub const DEFAULT_OWNER: &str = "anonymous";
const CONTENT_TYPE_ATTR: &str = "content-type";
const VERSION_ID_HEADER: &str = "x-amz-version-id";
const DELETE_MARKER_HEADER: &str = "x-amz-delete-marker";

/// Query params accepted on `/{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct BucketQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    /// Present (any value) to list versions.
    pub versions: Option<String>,
    #[serde(rename = "version-marker")]
    pub version_marker: Option<String>,
    /// Present (any value) to list in-flight multipart uploads.
    pub uploads: Option<String>,
    #[serde(rename = "upload-marker")]
    pub upload_marker: Option<String>,
    /// `true`/`false` on PUT toggles versioning of an existing bucket.
    pub versioning: Option<bool>,
    /// Present (any value) on GET to return usage stats.
    pub stats: Option<String>,
}

/// Query params accepted on `/{bucket}/{*key}`.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<i64>,
    #[serde(rename = "part-number-marker")]
    pub part_number_marker: Option<i64>,
    #[serde(rename = "max-parts")]
    pub max_parts: Option<usize>,
    /// Present (any value) on POST to start a multipart upload.
    pub uploads: Option<String>,
}

impl ObjectQuery {
    pub fn key(&self, name: &str) -> ObjectKey {
        match self.version_id.as_deref() {
            Some(v) => ObjectKey::with_version(name, v),
            None => ObjectKey::new(name),
        }
    }
}

/// Optional JSON body of `PUT /{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketReq {
    pub owner_id: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub versioning: bool,
    pub placement_name: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub version_id: String,
    pub size: i64,
    pub etag: String,
    pub last_modified: Timestamp,
}

impl From<&NamedVersion> for ObjectSummary {
    fn from(row: &NamedVersion) -> Self {
        Self {
            key: row.name.clone(),
            version_id: row.version.version_id.clone(),
            size: row.version.size,
            etag: row.version.etag.clone(),
            last_modified: row.version.commit_time,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListObjectsResponse {
    pub name: String,
    pub prefix: String,
    pub max_keys: usize,
    pub key_count: usize,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionSummary {
    pub key: String,
    pub version_id: String,
    pub is_latest: bool,
    pub delete_marker: bool,
    pub size: i64,
    pub etag: String,
    pub last_modified: Timestamp,
}

impl From<&VersionEntry> for VersionSummary {
    fn from(entry: &VersionEntry) -> Self {
        Self {
            key: entry.name.clone(),
            version_id: entry.version.version_id.clone(),
            is_latest: entry.is_latest,
            delete_marker: entry.version.is_delete_marker(),
            size: entry.version.size,
            etag: entry.version.etag.clone(),
            last_modified: entry.version.commit_time,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListVersionsResponse {
    pub name: String,
    pub is_truncated: bool,
    pub next_version_marker: Option<String>,
    pub versions: Vec<VersionSummary>,
}

#[derive(Debug, Serialize)]
pub struct BucketResponse {
    pub name: String,
    pub owner_id: String,
    pub versioning_enabled: bool,
    pub created_at: Timestamp,
}

impl From<&Bucket> for BucketResponse {
    fn from(bucket: &Bucket) -> Self {
        Self {
            name: bucket.name.clone(),
            owner_id: bucket.owner_id.clone(),
            versioning_enabled: bucket.versioning_enabled,
            created_at: bucket.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PutObjectResponse {
    pub etag: String,
    pub version_id: String,
    pub size: i64,
}

/// `GET /`: list live buckets.
pub async fn list_buckets(
    State(service): State<StorageService>,
) -> Result<Json<Vec<BucketResponse>>, AppError> {
    let buckets = service.list_buckets(None).await?;
    Ok(Json(buckets.iter().map(BucketResponse::from).collect()))
}

/// PUT `/{bucket}`: create bucket, or toggle versioning with `?versioning=`.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Some(enabled) = q.versioning {
        service.set_versioning(&bucket, enabled).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let req: CreateBucketReq = if body.is_empty() {
        CreateBucketReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid body: {}", err)))?
    };
    let owner_id = req.owner_id.unwrap_or_else(|| DEFAULT_OWNER.into());
    let owner = User::new(
        owner_id.clone(),
        req.display_name.unwrap_or_else(|| owner_id.clone()),
    );
    let placement = Placement {
        name: req.placement_name.unwrap_or_default(),
        storage_class: req.storage_class.unwrap_or_default(),
    };

    let handle = service
        .create_bucket(&bucket, &owner, placement, req.versioning)
        .await?;
    let info = handle.info();
    Ok((StatusCode::OK, Json(BucketResponse::from(&info))).into_response())
}

/// DELETE `/{bucket}`: soft-delete bucket.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/{bucket}`: list objects; `?versions` lists versions, `?uploads`
/// lists in-flight multipart uploads, `?stats` returns usage.
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
) -> Result<Response, AppError> {
    if q.uploads.is_some() {
        return list_multiparts(service, &bucket, &q).await;
    }
    if q.stats.is_some() {
        let stats: BucketStats = service.bucket_stats(&bucket).await?;
        return Ok(Json(stats).into_response());
    }

    let handle = service.get_bucket(&bucket).await?;
    let max_keys = q.max_keys.unwrap_or(1000).clamp(1, 1000);

    if q.versions.is_some() {
        let params = ListVersionsParams {
            prefix: q.prefix.clone(),
            marker: q.version_marker.as_deref().and_then(decode_version_marker),
            max_keys,
        };
        let result = handle.list_versions(&params).await?;
        let body = ListVersionsResponse {
            name: bucket,
            is_truncated: result.is_truncated,
            next_version_marker: result.next_marker.as_ref().map(encode_version_marker),
            versions: result.versions.iter().map(VersionSummary::from).collect(),
        };
        return Ok(Json(body).into_response());
    }

    let params = ListObjectsParams {
        prefix: q.prefix.clone(),
        delimiter: q.delimiter.clone(),
        continuation_token: q
            .continuation_token
            .as_deref()
            .map(decode_continuation_token),
        start_after: q.start_after.clone(),
        max_keys,
    };
    let result = handle.list_objects(&params).await?;
    let body = ListObjectsResponse {
        name: bucket,
        prefix: params.prefix.unwrap_or_default(),
        max_keys,
        key_count: result.key_count,
        is_truncated: result.is_truncated,
        next_continuation_token: result
            .next_continuation_token
            .as_deref()
            .map(encode_continuation_token),
        contents: result.objects.iter().map(ObjectSummary::from).collect(),
        common_prefixes: result.common_prefixes,
    };
    Ok(Json(body).into_response())
}

/// PUT `/{bucket}/{*key}`: upload an object, or a part with
/// `?uploadId=&partNumber=`.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if let Some(upload_id) = q.upload_id.as_deref() {
        return upload_part(service, &bucket, upload_id, q.part_number, body).await;
    }

    let handle = service.get_bucket(&bucket).await?;
    let mut attrs = Attrs::new();
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        attrs.insert(CONTENT_TYPE_ATTR.into(), ct.as_bytes().to_vec());
    }
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let result = write_stream(ObjectWriter::new(handle, key).with_attrs(attrs), stream).await?;

    let mut response = Json(PutObjectResponse {
        etag: result.etag.clone(),
        version_id: result.version_id.clone(),
        size: result.size,
    })
    .into_response();
    let resp_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", result.etag)) {
        resp_headers.insert(header::ETAG, value);
    }
    insert_version_header(resp_headers, &result.version_id);
    Ok(response)
}

/// GET `/{bucket}/{*key}`: stream an object, or list parts with `?uploadId=`.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    if let Some(upload_id) = q.upload_id.as_deref() {
        return list_parts(service, &bucket, upload_id, &q).await;
    }

    let handle = service.get_bucket(&bucket).await?;
    let reader = ObjectReader::open_key(&handle, &q.key(&key)).await?;
    let file = reader.open().await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), reader.object_version());
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    let handle = service.get_bucket(&bucket).await?;
    let version = handle.get(&q.key(&key)).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &version);
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`: delete an object or a version, or abort a
/// multipart upload with `?uploadId=`.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    let handle = service.get_bucket(&bucket).await?;
    if let Some(upload_id) = q.upload_id.as_deref() {
        handle.abort_multipart(upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let result: DeleteResult = ObjectDeleter::new(handle, q.key(&key)).delete().await?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    if result.delete_marker {
        headers.insert(
            HeaderName::from_static(DELETE_MARKER_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    if let Some(version_id) = result.version_id.as_deref() {
        insert_version_header(headers, version_id);
    }
    Ok(response)
}

fn insert_version_header(headers: &mut HeaderMap, version_id: &str) {
    if version_id.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(version_id) {
        headers.insert(HeaderName::from_static(VERSION_ID_HEADER), value);
    }
}

fn set_object_headers(headers: &mut HeaderMap, object: &ObjectVersion) {
    let version = object.version();
    let content_type = object
        .attrs()
        .get(CONTENT_TYPE_ATTR)
        .and_then(|v| HeaderValue::from_bytes(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(version.size.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", version.etag)) {
        headers.insert(header::ETAG, value);
    }
    if version.commit_time.is_set() {
        let modified = version.commit_time.to_datetime().to_rfc2822();
        if let Ok(value) = HeaderValue::from_str(&modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    insert_version_header(headers, &version.version_id);
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

fn encode_version_marker(marker: &VersionMarker) -> String {
    let raw = format!(
        "{}\n{}\n{}",
        marker.commit_time.as_nanos(),
        marker.id,
        marker.name
    );
    general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

fn decode_version_marker(token: &str) -> Option<VersionMarker> {
    let bytes = general_purpose::URL_SAFE_NO_PAD.decode(token).ok()?;
    let raw = String::from_utf8(bytes).ok()?;
    let mut fields = raw.splitn(3, '\n');
    let commit_time = fields.next()?.parse().ok()?;
    let id = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    Some(VersionMarker {
        name,
        commit_time: Timestamp::from_nanos(commit_time),
        id,
    })
}
