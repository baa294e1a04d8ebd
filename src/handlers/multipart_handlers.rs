//! Multipart upload endpoints.
//!
//! Init and complete arrive as `POST /{bucket}/{*key}`; part uploads, part
//! listings and aborts share the object routes and are dispatched here by
//! the object handlers when `uploadId` is present.

use crate::{
    errors::AppError,
    handlers::object_handlers::{BucketQuery, DEFAULT_OWNER, ObjectQuery},
    models::{
        multipart::{MultipartPart, MultipartUpload},
        object::Attrs,
        time::Timestamp,
    },
    services::{
        multipart_service::{CompletedPart, InitMultipart, ListMultipartsParams, MAX_PARTS},
        ops::write_stream,
        storage_service::StorageService,
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

const OWNER_HEADER: &str = "x-amz-owner-id";

#[derive(Debug, Serialize)]
pub struct InitMultipartResponse {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletePartReq {
    pub part_number: i64,
    pub etag: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteMultipartReq {
    pub parts: Vec<CompletePartReq>,
}

#[derive(Debug, Serialize)]
pub struct CompleteMultipartResponse {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub version_id: String,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    pub state: String,
    pub owner_id: String,
    pub initiated: Timestamp,
}

impl From<&MultipartUpload> for UploadSummary {
    fn from(upload: &MultipartUpload) -> Self {
        Self {
            key: upload.object_name.clone(),
            upload_id: upload.upload_id.clone(),
            state: upload.state.to_string(),
            owner_id: upload.owner_id.clone(),
            initiated: upload.mtime,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListUploadsResponse {
    pub bucket: String,
    pub is_truncated: bool,
    pub next_upload_marker: Option<String>,
    pub uploads: Vec<UploadSummary>,
}

#[derive(Debug, Serialize)]
pub struct PartSummary {
    pub part_number: i64,
    pub etag: String,
    pub size: i64,
    pub last_modified: Timestamp,
}

impl From<&MultipartPart> for PartSummary {
    fn from(part: &MultipartPart) -> Self {
        Self {
            part_number: part.part_num,
            etag: part.etag.clone().unwrap_or_default(),
            size: part.size,
            last_modified: part.mtime,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListPartsResponse {
    pub upload_id: String,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<i64>,
    pub parts: Vec<PartSummary>,
}

/// POST `/{bucket}/{*key}`: `?uploads` starts an upload, `?uploadId=`
/// completes one.
pub async fn post_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let handle = service.get_bucket(&bucket).await?;

    if let Some(upload_id) = q.upload_id.as_deref() {
        let req: CompleteMultipartReq = serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid part list: {}", err)))?;
        let parts: Vec<CompletedPart> = req
            .parts
            .into_iter()
            .map(|p| CompletedPart::new(p.part_number, p.etag))
            .collect();
        let result = handle.complete_multipart(upload_id, &parts).await?;
        let mut response = Json(CompleteMultipartResponse {
            bucket,
            key,
            etag: result.etag.clone(),
            version_id: result.version_id,
            size: result.size,
        })
        .into_response();
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", result.etag)) {
            response.headers_mut().insert(header::ETAG, value);
        }
        return Ok(response);
    }

    if q.uploads.is_none() {
        return Err(AppError::bad_request("expected ?uploads or ?uploadId="));
    }

    let owner_id = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_OWNER)
        .to_string();
    let mut attrs = Attrs::new();
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        attrs.insert("content-type".into(), ct.as_bytes().to_vec());
    }
    let info = handle.info();
    let upload = handle
        .init_multipart(InitMultipart {
            object_name: key.clone(),
            upload_id: None,
            owner_display_name: owner_id.clone(),
            owner_id,
            attrs,
            placement: info.placement(),
        })
        .await?;

    Ok((
        StatusCode::OK,
        Json(InitMultipartResponse {
            bucket,
            key,
            upload_id: upload.upload_id().to_string(),
        }),
    )
        .into_response())
}

/// PUT `/{bucket}/{*key}?uploadId=&partNumber=`
pub(crate) async fn upload_part(
    service: StorageService,
    bucket: &str,
    upload_id: &str,
    part_number: Option<i64>,
    body: Body,
) -> Result<Response, AppError> {
    let part_num =
        part_number.ok_or_else(|| AppError::bad_request("partNumber is required with uploadId"))?;
    let handle = service.get_bucket(bucket).await?;
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let result = write_stream(handle.part_writer(upload_id, part_num), stream).await?;

    let mut response = Json(PartSummary {
        part_number: result.part_num,
        etag: result.etag.clone(),
        size: result.size,
        last_modified: Timestamp::now(),
    })
    .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", result.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}?uploadId=`
pub(crate) async fn list_parts(
    service: StorageService,
    bucket: &str,
    upload_id: &str,
    q: &ObjectQuery,
) -> Result<Response, AppError> {
    let handle = service.get_bucket(bucket).await?;
    let result = handle
        .list_parts(
            upload_id,
            q.part_number_marker.unwrap_or(0),
            q.max_parts.unwrap_or(1000).min(MAX_PARTS),
        )
        .await?;
    Ok(Json(ListPartsResponse {
        upload_id: upload_id.to_string(),
        is_truncated: result.is_truncated,
        next_part_number_marker: result.next_part_number_marker,
        parts: result.parts.iter().map(PartSummary::from).collect(),
    })
    .into_response())
}

/// GET `/{bucket}?uploads`
pub(crate) async fn list_multiparts(
    service: StorageService,
    bucket: &str,
    q: &BucketQuery,
) -> Result<Response, AppError> {
    let handle = service.get_bucket(bucket).await?;
    let result = handle
        .list_multiparts(&ListMultipartsParams {
            prefix: q.prefix.clone(),
            marker: q.upload_marker.clone(),
            max_uploads: q.max_keys.unwrap_or(1000),
        })
        .await?;
    Ok(Json(ListUploadsResponse {
        bucket: bucket.to_string(),
        is_truncated: result.is_truncated,
        next_upload_marker: result.next_marker,
        uploads: result.uploads.iter().map(UploadSummary::from).collect(),
    })
    .into_response())
}
