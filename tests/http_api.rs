mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sfs_store::{routes::routes::routes, services::storage_service::StorageService};
use tempfile::TempDir;
use tower::ServiceExt;

async fn app(dir: &TempDir) -> (Router, StorageService) {
    let service = common::open_service(dir.path()).await;
    (routes().with_state(service.clone()), service)
}

async fn send(app: &Router, method: Method, uri: &str, body: impl Into<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

fn json_of(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn health_endpoints_respond() {
    let dir = TempDir::new().unwrap();
    let (app, _) = app(&dir).await;

    let (status, _, body) = send(&app, Method::GET, "/healthz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["status"], "ok");

    let (status, _, body) = send(&app, Method::GET, "/readyz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["checks"]["sqlite"]["ok"], true);
}

#[tokio::test]
async fn object_round_trip_over_http() {
    let dir = TempDir::new().unwrap();
    let (app, _) = app(&dir).await;

    let (status, _, _) = send(&app, Method::PUT, "/photos", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/photos/2025/img.txt")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello http"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{:x}\"", md5::compute(b"hello http")));

    let (status, headers, body) =
        send(&app, Method::GET, "/photos/2025/img.txt", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello http");
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");

    let (status, headers, body) =
        send(&app, Method::HEAD, "/photos/2025/img.txt", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers[header::CONTENT_LENGTH], "10");

    let (status, _, body) = send(&app, Method::GET, "/photos?delimiter=/", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["common_prefixes"], json!(["2025/"]));

    let (status, _, _) = send(&app, Method::DELETE, "/photos", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(&app, Method::DELETE, "/photos/2025/img.txt", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send(&app, Method::GET, "/photos/2025/img.txt", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, Method::DELETE, "/photos", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send(&app, Method::GET, "/photos", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn versioned_delete_returns_marker_headers() {
    let dir = TempDir::new().unwrap();
    let (app, _) = app(&dir).await;

    let (status, _, _) = send(&app, Method::PUT, "/vers", json!({"versioning": true}).to_string()).await;
    assert_eq!(status, StatusCode::OK);
    let (_, headers, _) = send(&app, Method::PUT, "/vers/k", "v1").await;
    let v1 = headers["x-amz-version-id"].to_str().unwrap().to_string();

    let (status, headers, _) = send(&app, Method::DELETE, "/vers/k", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["x-amz-delete-marker"], "true");

    let (status, _, _) = send(&app, Method::GET, "/vers/k", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, body) =
        send(&app, Method::GET, &format!("/vers/k?versionId={v1}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"v1");

    let (_, _, body) = send(&app, Method::GET, "/vers?versions", Body::empty()).await;
    let listing = json_of(&body);
    let versions = listing["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["delete_marker"], true);
    assert_eq!(versions[0]["is_latest"], true);
}

#[tokio::test]
async fn multipart_over_http() {
    let dir = TempDir::new().unwrap();
    let (app, _) = app(&dir).await;
    send(&app, Method::PUT, "/mp-bucket", Body::empty()).await;

    let (status, _, body) = send(&app, Method::POST, "/mp-bucket/big?uploads", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let upload_id = json_of(&body)["upload_id"].as_str().unwrap().to_string();

    let mut parts = Vec::new();
    for (n, data) in [(1, "first-"), (2, "second")] {
        let (status, _, body) = send(
            &app,
            Method::PUT,
            &format!("/mp-bucket/big?uploadId={upload_id}&partNumber={n}"),
            data,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let etag = json_of(&body)["etag"].as_str().unwrap().to_string();
        parts.push(json!({"part_number": n, "etag": etag}));
    }

    let (_, _, body) = send(&app, Method::GET, "/mp-bucket?uploads", Body::empty()).await;
    assert_eq!(json_of(&body)["uploads"].as_array().unwrap().len(), 1);

    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!("/mp-bucket/big?uploadId={upload_id}"),
        Body::empty(),
    )
    .await;
    assert_eq!(json_of(&body)["parts"].as_array().unwrap().len(), 2);

    let (status, _, body) = send(
        &app,
        Method::POST,
        &format!("/mp-bucket/big?uploadId={upload_id}"),
        json!({ "parts": parts }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json_of(&body)["etag"].as_str().unwrap().ends_with("-2"));

    let (_, _, body) = send(&app, Method::GET, "/mp-bucket/big", Body::empty()).await;
    assert_eq!(body, b"first-second");
}

#[tokio::test]
async fn admin_endpoints_drive_gc_and_wal() {
    let dir = TempDir::new().unwrap();
    let (app, service) = app(&dir).await;

    let (status, _, _) = send(&app, Method::POST, "/_admin/gc/suspend", Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(service.gc().is_suspended());
    let (_, _, body) = send(&app, Method::GET, "/_admin/gc", Body::empty()).await;
    assert_eq!(json_of(&body)["suspended"], true);
    send(&app, Method::POST, "/_admin/gc/resume", Body::empty()).await;
    assert!(!service.gc().is_suspended());

    let (status, _, body) = send(&app, Method::POST, "/_admin/gc/run", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["versions_deleted"], 0);

    let (status, _, body) =
        send(&app, Method::POST, "/_admin/wal/checkpoint", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["ran"], true);
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let dir = TempDir::new().unwrap();
    let (app, _) = app(&dir).await;

    let (status, _, _) = send(&app, Method::PUT, "/A_", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&app, Method::GET, "/missing/key", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app, Method::PUT, "/dup", Body::empty()).await;
    let (status, _, _) = send(&app, Method::PUT, "/dup", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(&app, Method::DELETE, "/dup/k?uploadId=nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
