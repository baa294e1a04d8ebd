mod common;

use common::{files_matching, make_bucket, md5_hex, open_service, put, put_part, read};
use sfs_store::{
    models::{bucket::Placement, multipart::MultipartState, object::ObjectKey},
    services::multipart_service::{
        CompletedPart, InitMultipart, ListMultipartsParams, multipart_etag,
    },
    store::{error::StorageError, paths},
};
use tempfile::TempDir;

fn init(name: &str) -> InitMultipart {
    InitMultipart {
        object_name: name.to_string(),
        upload_id: None,
        owner_id: "owner-1".into(),
        owner_display_name: "Owner One".into(),
        attrs: Default::default(),
        placement: Placement::default(),
    }
}

#[tokio::test]
async fn upload_parts_and_complete_into_single_version() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "mp-bucket", false).await;

    let upload = bucket.init_multipart(init("big/file.bin")).await.unwrap();
    let upload_id = upload.upload_id().to_string();
    assert_eq!(upload.upload().state, MultipartState::Init);

    // Out of order on purpose; completion concatenates by part number.
    let p2 = put_part(&bucket, &upload_id, 2, b"world").await.unwrap();
    let p1 = put_part(&bucket, &upload_id, 1, b"hello ").await.unwrap();
    assert_eq!(p1.etag, md5_hex(b"hello "));
    assert_eq!(
        bucket.multipart_info(&upload_id).await.unwrap().state,
        MultipartState::InProgress
    );

    let listed = bucket.list_parts(&upload_id, 0, 100).await.unwrap();
    let nums: Vec<_> = listed.parts.iter().map(|p| p.part_num).collect();
    assert_eq!(nums, vec![1, 2]);

    let result = bucket
        .complete_multipart(
            &upload_id,
            &[
                CompletedPart::new(1, p1.etag.clone()),
                CompletedPart::new(2, format!("\"{}\"", p2.etag)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.size, 11);
    assert_eq!(
        result.etag,
        multipart_etag([p1.etag.as_str(), p2.etag.as_str()]).unwrap()
    );
    assert!(result.etag.ends_with("-2"));

    assert_eq!(
        read(&bucket, &ObjectKey::new("big/file.bin")).await.unwrap(),
        b"hello world"
    );

    // The upload is no longer in flight, but completing again is answered
    // from the recorded result.
    assert!(matches!(
        bucket.multipart_info(&upload_id).await,
        Err(StorageError::NoSuchUpload(_))
    ));
    let again = bucket
        .complete_multipart(&upload_id, &[CompletedPart::new(1, p1.etag)])
        .await
        .unwrap();
    assert_eq!(again, result);
}

#[tokio::test]
async fn rewriting_a_part_replaces_it() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "rewrite", false).await;

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    put_part(&bucket, &upload_id, 1, b"first try").await.unwrap();
    let second = put_part(&bucket, &upload_id, 1, b"second").await.unwrap();

    let result = bucket
        .complete_multipart(&upload_id, &[CompletedPart::new(1, second.etag)])
        .await
        .unwrap();
    assert_eq!(result.size, 6);
    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"second");
}

#[tokio::test]
async fn invalid_completions_leave_upload_untouched() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "invalid", false).await;

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    let p1 = put_part(&bucket, &upload_id, 1, b"abc").await.unwrap();
    let p2 = put_part(&bucket, &upload_id, 2, b"defgh").await.unwrap();

    let wrong_etag = bucket
        .complete_multipart(
            &upload_id,
            &[
                CompletedPart::new(1, md5_hex(b"nope")),
                CompletedPart::new(2, p2.etag.clone()),
            ],
        )
        .await;
    assert!(matches!(wrong_etag, Err(StorageError::InvalidPart { part_num: 1, .. })));

    let unordered = bucket
        .complete_multipart(
            &upload_id,
            &[
                CompletedPart::new(2, p2.etag.clone()),
                CompletedPart::new(1, p1.etag.clone()),
            ],
        )
        .await;
    assert!(matches!(unordered, Err(StorageError::InvalidPart { .. })));

    let missing = bucket
        .complete_multipart(&upload_id, &[CompletedPart::new(1, p1.etag.clone())])
        .await;
    assert!(matches!(missing, Err(StorageError::InvalidPart { .. })));

    // Part 1 is 3 bytes, below the 4 byte minimum of the test config.
    let too_small = bucket
        .complete_multipart(
            &upload_id,
            &[
                CompletedPart::new(1, p1.etag.clone()),
                CompletedPart::new(2, p2.etag.clone()),
            ],
        )
        .await;
    assert!(matches!(too_small, Err(StorageError::PartTooSmall { part_num: 1 })));

    let info = bucket.multipart_info(&upload_id).await.unwrap();
    assert_eq!(info.state, MultipartState::InProgress);
    assert_eq!(bucket.list_parts(&upload_id, 0, 10).await.unwrap().parts.len(), 2);
}

#[tokio::test]
async fn abort_rejects_further_parts_and_completion() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "abort", false).await;

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    let p1 = put_part(&bucket, &upload_id, 1, b"data").await.unwrap();
    bucket.abort_multipart(&upload_id).await.unwrap();

    assert!(matches!(
        put_part(&bucket, &upload_id, 2, b"more").await,
        Err(StorageError::NoSuchUpload(_))
    ));
    assert!(matches!(
        bucket
            .complete_multipart(&upload_id, &[CompletedPart::new(1, p1.etag)])
            .await,
        Err(StorageError::NoSuchUpload(_))
    ));
    assert!(matches!(
        bucket.abort_multipart(&upload_id).await,
        Err(StorageError::NoSuchUpload(_))
    ));
    assert!(matches!(
        bucket.abort_multipart("does-not-exist").await,
        Err(StorageError::NoSuchUpload(_))
    ));
}

#[tokio::test]
async fn part_numbers_out_of_range_are_rejected() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "range", false).await;

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    for part_num in [0, 10_001] {
        assert!(matches!(
            put_part(&bucket, &upload_id, part_num, b"x").await,
            Err(StorageError::InvalidPart { .. })
        ));
    }
}

#[tokio::test]
async fn explicit_upload_ids_are_unique() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "unique", false).await;

    let req = InitMultipart {
        upload_id: Some("fixed-id".into()),
        ..init("k")
    };
    bucket.init_multipart(req.clone()).await.unwrap();
    assert!(matches!(
        bucket.init_multipart(req).await,
        Err(StorageError::UploadAlreadyExists(_))
    ));
}

#[tokio::test]
async fn listing_in_flight_uploads_pages_by_key() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "uploads", false).await;

    for name in ["a", "b", "c"] {
        bucket.init_multipart(init(name)).await.unwrap();
    }
    let aborted = bucket.init_multipart(init("d")).await.unwrap();
    bucket.abort_multipart(aborted.upload_id()).await.unwrap();

    let first = bucket
        .list_multiparts(&ListMultipartsParams {
            max_uploads: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(first.is_truncated);
    let names: Vec<_> = first.uploads.iter().map(|u| u.object_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let rest = bucket
        .list_multiparts(&ListMultipartsParams {
            marker: first.next_marker,
            max_uploads: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!rest.is_truncated);
    let names: Vec<_> = rest.uploads.iter().map(|u| u.object_name.as_str()).collect();
    assert_eq!(names, vec!["c"]);
}

#[tokio::test]
async fn part_number_mismatch_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "mismatch", false).await;

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    let p1 = put_part(&bucket, &upload_id, 1, b"aaaa").await.unwrap();
    put_part(&bucket, &upload_id, 3, b"cccc").await.unwrap();

    let result = bucket
        .complete_multipart(
            &upload_id,
            &[
                CompletedPart::new(1, p1.etag),
                CompletedPart::new(2, md5_hex(b"bbbb")),
            ],
        )
        .await;
    assert!(matches!(result, Err(StorageError::InvalidPart { part_num: 2, .. })));
    assert!(matches!(
        bucket.get(&ObjectKey::new("k")).await,
        Err(StorageError::ObjectNotFound { .. })
    ));
    assert_eq!(common::payload_files(dir.path()), 2);
}

#[tokio::test]
async fn failed_publish_discards_the_new_version() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "publish-fail", false).await;

    put(&bucket, "k", b"original").await;
    let current = bucket.get(&ObjectKey::new("k")).await.unwrap();

    let upload_id = bucket.init_multipart(init("k")).await.unwrap().upload_id().to_string();
    let p1 = put_part(&bucket, &upload_id, 1, b"aaaa").await.unwrap();
    let p2 = put_part(&bucket, &upload_id, 2, b"bb").await.unwrap();

    // The completion's version lands on the next row id; a non-empty
    // directory in its place makes the final rename fail.
    let blocked = dir
        .path()
        .join(paths::version_path(&current.object().uuid, current.row_id() + 1));
    std::fs::create_dir_all(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    let err = bucket
        .complete_multipart(
            &upload_id,
            &[CompletedPart::new(1, p1.etag), CompletedPart::new(2, p2.etag)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Io(_)), "{err:?}");

    let open: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE object_state = 0")
        .fetch_one(service.store().pool())
        .await
        .unwrap();
    assert_eq!(open, 0);
    let discarded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE object_state = 2")
        .fetch_one(service.store().pool())
        .await
        .unwrap();
    assert_eq!(discarded, 1);
    assert_eq!(files_matching(dir.path(), |name| name.ends_with(".m")), 0);
    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"original");

    bucket.abort_multipart(&upload_id).await.unwrap();
}

#[tokio::test]
async fn upload_listing_prefix_is_case_sensitive() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "upload-cases", false).await;

    for name in ["Report", "report", "other"] {
        bucket.init_multipart(init(name)).await.unwrap();
    }
    let listed = bucket
        .list_multiparts(&ListMultipartsParams {
            prefix: Some("r".into()),
            max_uploads: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = listed.uploads.iter().map(|u| u.object_name.as_str()).collect();
    assert_eq!(names, vec!["report"]);
}
