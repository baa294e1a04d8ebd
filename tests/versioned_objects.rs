mod common;

use common::{make_bucket, open_service, put, read};
use sfs_store::{
    models::{
        object::{ObjectKey, ObjectState, Version},
        time::Timestamp,
    },
    services::bucket::{ListObjectsParams, ListVersionsParams},
    store::{error::StorageError, versions},
};
use tempfile::TempDir;

#[tokio::test]
async fn each_put_creates_a_new_addressable_version() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "versioned", true).await;

    let v1 = put(&bucket, "k", b"one").await;
    let v2 = put(&bucket, "k", b"two").await;
    assert!(!v1.version_id.is_empty());
    assert_ne!(v1.version_id, v2.version_id);

    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"two");
    assert_eq!(
        read(&bucket, &ObjectKey::with_version("k", v1.version_id.as_str()))
            .await
            .unwrap(),
        b"one"
    );
}

#[tokio::test]
async fn delete_without_version_adds_marker_and_marker_removal_undeletes() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "markers", true).await;

    let v1 = put(&bucket, "k", b"data").await;
    let deleted = bucket.delete(&ObjectKey::new("k")).await.unwrap();
    assert!(deleted.delete_marker);
    let marker_id = deleted.version_id.clone().unwrap();

    assert!(matches!(
        bucket.get(&ObjectKey::new("k")).await,
        Err(StorageError::ObjectNotFound { .. })
    ));
    // Older versions stay reachable by id.
    assert_eq!(
        read(&bucket, &ObjectKey::with_version("k", v1.version_id.as_str()))
            .await
            .unwrap(),
        b"data"
    );
    assert!(bucket.list_objects(&listing(10)).await.unwrap().objects.is_empty());

    let undeleted = bucket
        .delete(&ObjectKey::with_version("k", marker_id.as_str()))
        .await
        .unwrap();
    assert!(undeleted.deleted);
    assert!(undeleted.delete_marker);
    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"data");
}

#[tokio::test]
async fn deleting_a_specific_version_exposes_the_previous_one() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "specific", true).await;

    put(&bucket, "k", b"old").await;
    let newest = put(&bucket, "k", b"new").await;
    let result = bucket
        .delete(&ObjectKey::with_version("k", newest.version_id.as_str()))
        .await
        .unwrap();
    assert!(result.deleted);
    assert!(!result.delete_marker);
    assert_eq!(read(&bucket, &ObjectKey::new("k")).await.unwrap(), b"old");
}

#[tokio::test]
async fn delete_marker_for_missing_object_is_still_created() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "phantom", true).await;

    let result = bucket.delete(&ObjectKey::new("nothing")).await.unwrap();
    assert!(result.delete_marker);
    let listing = bucket
        .list_versions(&ListVersionsParams {
            max_keys: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listing.versions.len(), 1);
    assert!(listing.versions[0].is_latest);
    assert!(listing.versions[0].version.is_delete_marker());
}

#[tokio::test]
async fn equal_commit_times_resolve_to_highest_row_id() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "ties", true).await;
    let pool = service.store().pool();

    let mut conn = pool.acquire().await.unwrap();
    let object = versions::get_or_insert_object(&mut conn, bucket.id(), "tied")
        .await
        .unwrap();
    let stamp = Timestamp::from_nanos(1_700_000_000_000_000_000);
    let mut ids = Vec::new();
    for (n, version_id) in ["first", "second", "third"].into_iter().enumerate() {
        let mut version = Version::new_open(object.uuid, version_id);
        version.object_state = ObjectState::Committed;
        version.commit_time = stamp;
        version.size = n as i64;
        ids.push(versions::insert_version(&mut *conn, &version).await.unwrap());
    }
    drop(conn);

    let latest = bucket.get(&ObjectKey::new("tied")).await.unwrap();
    assert_eq!(latest.row_id(), ids[2]);
    assert_eq!(latest.version_id(), "third");

    let listing = bucket
        .list_versions(&ListVersionsParams {
            max_keys: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    let order: Vec<_> = listing
        .versions
        .iter()
        .map(|v| (v.version.version_id.as_str(), v.is_latest))
        .collect();
    assert_eq!(
        order,
        vec![("third", true), ("second", false), ("first", false)]
    );
}

#[tokio::test]
async fn version_listing_paginates_with_marker() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "pages", true).await;

    for data in [b"1", b"2", b"3"] {
        put(&bucket, "a", data).await;
    }
    put(&bucket, "b", b"4").await;

    let mut seen = Vec::new();
    let mut params = ListVersionsParams {
        max_keys: 2,
        ..Default::default()
    };
    loop {
        let page = bucket.list_versions(&params).await.unwrap();
        seen.extend(page.versions.iter().map(|v| (v.name.clone(), v.version.size)));
        if !page.is_truncated {
            break;
        }
        params.marker = page.next_marker;
    }
    let names: Vec<_> = seen.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a", "a", "a", "b"]);
}

#[tokio::test]
async fn toggling_versioning_switches_id_generation() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "toggle", false).await;

    assert_eq!(put(&bucket, "k", b"a").await.version_id, "");
    service.set_versioning("toggle", true).await.unwrap();
    assert!(bucket.versioned());
    assert!(!put(&bucket, "k", b"b").await.version_id.is_empty());
}

fn listing(max_keys: usize) -> ListObjectsParams {
    ListObjectsParams {
        max_keys,
        ..Default::default()
    }
}

#[tokio::test]
async fn object_listing_pages_and_groups_by_delimiter() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "listing", false).await;

    for name in ["a.txt", "b.txt", "c.txt", "photos/1.jpg", "photos/2.jpg"] {
        put(&bucket, name, b"x").await;
    }

    let first = bucket.list_objects(&listing(2)).await.unwrap();
    assert!(first.is_truncated);
    let names: Vec<_> = first.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    let second = bucket
        .list_objects(&ListObjectsParams {
            continuation_token: first.next_continuation_token.clone(),
            ..listing(2)
        })
        .await
        .unwrap();
    let names: Vec<_> = second.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["c.txt", "photos/1.jpg"]);

    let grouped = bucket
        .list_objects(&ListObjectsParams {
            delimiter: Some("/".into()),
            ..listing(100)
        })
        .await
        .unwrap();
    assert_eq!(grouped.objects.len(), 3);
    assert_eq!(grouped.common_prefixes, vec!["photos/".to_string()]);
    assert_eq!(grouped.key_count, 4);

    let prefixed = bucket
        .list_objects(&ListObjectsParams {
            prefix: Some("photos/".into()),
            ..listing(100)
        })
        .await
        .unwrap();
    assert_eq!(prefixed.objects.len(), 2);
}

#[tokio::test]
async fn prefix_matching_is_case_sensitive() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "cases", true).await;

    for name in ["Apple", "apple", "a_b", "axb"] {
        put(&bucket, name, b"x").await;
    }

    let listed = bucket
        .list_objects(&ListObjectsParams {
            prefix: Some("a".into()),
            ..listing(100)
        })
        .await
        .unwrap();
    let names: Vec<_> = listed.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a_b", "apple", "axb"]);

    // `_` and `%` are literal characters in a prefix.
    let literal = bucket
        .list_objects(&ListObjectsParams {
            prefix: Some("a_".into()),
            ..listing(100)
        })
        .await
        .unwrap();
    let names: Vec<_> = literal.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a_b"]);

    let versions = bucket
        .list_versions(&ListVersionsParams {
            prefix: Some("A".into()),
            max_keys: 100,
            ..Default::default()
        })
        .await
        .unwrap();
    let names: Vec<_> = versions.versions.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["Apple"]);
}

#[tokio::test]
async fn delimiter_pages_do_not_repeat_a_common_prefix() {
    let dir = TempDir::new().unwrap();
    let service = open_service(dir.path()).await;
    let bucket = make_bucket(&service, "grouped", false).await;

    for name in ["a.txt", "logs/1", "logs/2", "logs/3", "z.txt"] {
        put(&bucket, name, b"x").await;
    }
    let grouped = |token: Option<String>| ListObjectsParams {
        delimiter: Some("/".into()),
        continuation_token: token,
        ..listing(2)
    };

    let first = bucket.list_objects(&grouped(None)).await.unwrap();
    let names: Vec<_> = first.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt"]);
    assert_eq!(first.common_prefixes, vec!["logs/".to_string()]);
    assert!(first.is_truncated);
    assert_eq!(first.next_continuation_token.as_deref(), Some("logs/"));

    let second = bucket
        .list_objects(&grouped(first.next_continuation_token))
        .await
        .unwrap();
    let names: Vec<_> = second.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["z.txt"]);
    assert!(second.common_prefixes.is_empty());
    assert!(!second.is_truncated);
}
