//! Route table.
//!
//! ## Structure
//! - **Service endpoints**
//!   - `GET  /healthz`, `GET /readyz`
//!   - `GET  /_admin/gc`, `POST /_admin/gc/{run,suspend,resume}`
//!   - `POST /_admin/wal/checkpoint`
//!
//! - **Bucket-level endpoints**
//!   - `GET    /`: list buckets
//!   - `GET    /{bucket}`: list objects (`?versions`, `?uploads`, `?stats`)
//!   - `PUT    /{bucket}`: create bucket, or `?versioning=` to toggle
//!   - `DELETE /{bucket}`: delete bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: upload object, or a part with `?uploadId=&partNumber=`
//!   - `GET    /{bucket}/{*key}`: download object, or list parts with `?uploadId=`
//!   - `HEAD   /{bucket}/{*key}`: retrieve metadata only
//!   - `POST   /{bucket}/{*key}`: `?uploads` to start, `?uploadId=` to complete a multipart upload
//!   - `DELETE /{bucket}/{*key}`: delete object or version, or abort an upload with `?uploadId=`
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        admin_handlers::{gc_resume, gc_run, gc_status, gc_suspend, wal_checkpoint},
        health_handlers::{healthz, readyz},
        multipart_handlers::post_object,
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, list_buckets,
            list_objects, upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router. Every handler shares the `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // maintenance
        .route("/_admin/gc", get(gc_status))
        .route("/_admin/gc/run", post(gc_run))
        .route("/_admin/gc/suspend", post(gc_suspend))
        .route("/_admin/gc/resume", post(gc_resume))
        .route("/_admin/wal/checkpoint", post(wal_checkpoint))
        .route("/", get(list_buckets))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .post(post_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects).put(create_bucket).delete(delete_bucket),
        )
}
