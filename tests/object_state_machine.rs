mod common;

use common::{make_bucket, md5_hex, open_service, put, read};
use sfs_store::{
    models::object::{ObjectKey, ObjectState},
    services::version::CommitInfo,
    store::error::StorageError,
};
use tempfile::TempDir;

#[tokio::test]
async fn put_then_get_returns_committed_payload() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "plain", false).await;

    let written = put(&bucket, "docs/readme.txt", b"hello world").await;
    assert_eq!(written.size, 11);
    assert_eq!(written.etag, md5_hex(b"hello world"));
    assert_eq!(written.version_id, "");

    let version = bucket.get(&ObjectKey::new("docs/readme.txt")).await.unwrap();
    assert_eq!(version.state(), ObjectState::Committed);
    assert_eq!(version.version().size, 11);
    assert!(version.version().commit_time.is_set());
    assert_eq!(
        read(&bucket, &ObjectKey::new("docs/readme.txt")).await.unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn open_version_is_invisible_until_commit() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "open-state", false).await;

    let mut version = bucket.create_version("pending", None).await.unwrap();
    assert_eq!(version.state(), ObjectState::Open);
    assert!(matches!(
        bucket.get(&ObjectKey::new("pending")).await,
        Err(StorageError::ObjectNotFound { .. })
    ));

    let path = version.path();
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, b"abc").await.unwrap();
    let committed = version
        .commit(CommitInfo {
            size: 3,
            etag: md5_hex(b"abc"),
            checksum: md5_hex(b"abc"),
        })
        .await
        .unwrap();
    assert!(committed);
    assert_eq!(version.state(), ObjectState::Committed);
    assert!(bucket.get(&ObjectKey::new("pending")).await.is_ok());
}

#[tokio::test]
async fn second_commit_of_same_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "double-commit", false).await;

    let mut version = bucket.create_version("obj", None).await.unwrap();
    let info = CommitInfo {
        size: 0,
        etag: md5_hex(b""),
        checksum: md5_hex(b""),
    };
    assert!(version.commit(info.clone()).await.unwrap());

    let mut stale = bucket.get(&ObjectKey::new("obj")).await.unwrap();
    assert!(!stale.commit(info).await.unwrap());
}

#[tokio::test]
async fn last_committer_wins_on_unversioned_bucket() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "last-wins", false).await;

    let mut open = Vec::new();
    for _ in 0..4 {
        open.push(bucket.create_version("contended", None).await.unwrap());
    }
    assert!(open.iter().all(|v| v.state() == ObjectState::Open));

    let info = CommitInfo {
        size: 0,
        etag: md5_hex(b""),
        checksum: md5_hex(b""),
    };
    for version in &mut open {
        assert!(version.commit(info.clone()).await.unwrap());
    }

    let mut states = Vec::new();
    for version in &mut open {
        version.refresh().await.unwrap();
        states.push(version.state());
    }
    assert_eq!(
        states,
        vec![
            ObjectState::Deleted,
            ObjectState::Deleted,
            ObjectState::Deleted,
            ObjectState::Committed,
        ]
    );
    let latest = bucket.get(&ObjectKey::new("contended")).await.unwrap();
    assert_eq!(latest.row_id(), open[3].row_id());

    // A superseded version cannot come back.
    assert!(!open[0].commit(info).await.unwrap());
    open[0].refresh().await.unwrap();
    assert_eq!(open[0].state(), ObjectState::Deleted);
}

#[tokio::test]
async fn overwrite_in_unversioned_bucket_keeps_single_visible_version() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "overwrite", false).await;

    put(&bucket, "k", b"first").await;
    put(&bucket, "k", b"second").await;

    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"second");
    let all = bucket.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].version.size, 6);
}

#[tokio::test]
async fn delete_hides_object_and_missing_object_is_not_found() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "deletes", false).await;

    put(&bucket, "gone", b"bye").await;
    let result = bucket.delete(&ObjectKey::new("gone")).await.unwrap();
    assert!(result.deleted);
    assert!(!result.delete_marker);

    assert!(matches!(
        bucket.get(&ObjectKey::new("gone")).await,
        Err(StorageError::ObjectNotFound { .. })
    ));
    assert!(matches!(
        bucket.get(&ObjectKey::new("never-there")).await,
        Err(StorageError::ObjectNotFound { .. })
    ));

    let again = bucket.delete(&ObjectKey::new("gone")).await.unwrap();
    assert!(!again.deleted);
}

#[tokio::test]
async fn null_version_id_addresses_implicit_version() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "nullid", false).await;

    put(&bucket, "k", b"payload").await;
    let key = ObjectKey::with_version("k", "null");
    assert_eq!(read(&bucket, &key).await.unwrap(), b"payload");
}

#[tokio::test]
async fn unsafe_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "keys", false).await;

    assert!(matches!(
        bucket.create_version("", None).await,
        Err(StorageError::InvalidObjectKey)
    ));
    assert!(matches!(
        bucket.create_version("bad\u{0}name", None).await,
        Err(StorageError::InvalidObjectKey)
    ));
}

#[tokio::test]
async fn bucket_lifecycle_checks_emptiness() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "life", false).await;

    assert!(matches!(
        service
            .create_bucket("life", &common::owner(), Default::default(), false)
            .await,
        Err(StorageError::BucketAlreadyExists(_))
    ));

    put(&bucket, "obj", b"x").await;
    assert!(matches!(
        service.delete_bucket("life").await,
        Err(StorageError::BucketNotEmpty(_))
    ));

    bucket.delete(&ObjectKey::new("obj")).await.unwrap();
    service.delete_bucket("life").await.unwrap();
    assert!(matches!(
        service.get_bucket("life").await,
        Err(StorageError::BucketNotFound(_))
    ));

    // The name is free again once the old bucket is soft-deleted.
    make_bucket(&service, "life", true).await;
    assert_eq!(service.list_buckets(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn bucket_stats_count_visible_data() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "stats", false).await;

    put(&bucket, "a", b"1234").await;
    put(&bucket, "b", b"56").await;
    let stats = service.bucket_stats("stats").await.unwrap();
    assert_eq!(stats.object_count, 2);
    assert_eq!(stats.size, 6);
}

#[tokio::test]
async fn bucket_owner_is_registered_as_user() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    make_bucket(&service, "owned", false).await;

    let user = service.get_user("owner-1").await.unwrap().unwrap();
    assert_eq!(user.display_name, "Owner One");

    let mut renamed = user.clone();
    renamed.display_name = "Renamed".to_string();
    service.store_user(&renamed).await.unwrap();
    let user = service.get_user("owner-1").await.unwrap().unwrap();
    assert_eq!(user.display_name, "Renamed");
    assert!(service.get_user("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn writes_are_refused_below_free_space_threshold() {
    let dir = TempDir::new().unwrap();
    let config = sfs_store::config::StoreConfig {
        min_free_space: u64::MAX,
        ..common::test_config(dir.path())
    };
    let service = sfs_store::services::storage_service::StorageService::open(config)
        .await
        .unwrap();
    let bucket = make_bucket(&service, "full", false).await;

    let err = common::try_put(&bucket, "k", b"data").await.unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded), "{err:?}");
    assert!(bucket.get(&ObjectKey::new("k")).await.is_err());
}
