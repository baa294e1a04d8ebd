#![allow(dead_code)]

use bytes::Bytes;
use futures::stream;
use sfs_store::{
    config::StoreConfig,
    models::{bucket::Placement, object::ObjectKey, user::User},
    services::{
        bucket::BucketHandle,
        ops::{ObjectReader, ObjectWriter, ReadOp, WriteResult, write_stream},
        storage_service::StorageService,
    },
    store::error::StorageResult,
};
use std::{io, path::Path, sync::Arc, time::Duration};
use tokio::io::AsyncReadExt;

pub fn test_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        gc_period: Duration::from_secs(3600),
        gc_max_process_time: Duration::from_secs(30),
        multipart_min_part_size: 4,
        ..StoreConfig::with_data_path(dir)
    }
}

pub async fn open_service(dir: &Path) -> StorageService {
    StorageService::open(test_config(dir)).await.unwrap()
}

pub fn owner() -> User {
    User::new("owner-1".to_string(), "Owner One".to_string())
}

pub async fn make_bucket(service: &StorageService, name: &str, versioned: bool) -> Arc<BucketHandle> {
    service
        .create_bucket(name, &owner(), Placement::default(), versioned)
        .await
        .unwrap()
}

fn body(chunks: &[&[u8]]) -> impl futures::Stream<Item = io::Result<Bytes>> {
    let chunks: Vec<io::Result<Bytes>> = chunks
        .iter()
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}

pub async fn try_put(bucket: &Arc<BucketHandle>, name: &str, data: &[u8]) -> StorageResult<WriteResult> {
    write_stream(ObjectWriter::new(bucket.clone(), name), body(&[data])).await
}

pub async fn put(bucket: &Arc<BucketHandle>, name: &str, data: &[u8]) -> WriteResult {
    try_put(bucket, name, data).await.unwrap()
}

pub async fn put_part(
    bucket: &Arc<BucketHandle>,
    upload_id: &str,
    part_num: i64,
    data: &[u8],
) -> StorageResult<sfs_store::services::multipart_service::PartWriteResult> {
    write_stream(bucket.part_writer(upload_id, part_num), body(&[data])).await
}

pub async fn read(bucket: &Arc<BucketHandle>, key: &ObjectKey) -> StorageResult<Vec<u8>> {
    let reader = ObjectReader::open_key(bucket, key).await?;
    let mut file = reader.open().await?;
    let mut out = Vec::new();
    file.read_to_end(&mut out).await?;
    Ok(out)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Number of regular files under `dir`, skipping the metadata database.
pub fn payload_files(dir: &Path) -> usize {
    files_matching(dir, |name| !name.starts_with("s3gw.db"))
}

/// Number of regular files under `dir` whose name satisfies `keep`.
pub fn files_matching(dir: &Path, keep: impl Fn(&str) -> bool) -> usize {
    fn walk(dir: &Path, keep: &dyn Fn(&str) -> bool, count: &mut usize) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, keep, count);
            } else if path.file_name().and_then(|n| n.to_str()).is_some_and(keep) {
                *count += 1;
            }
        }
    }
    let mut count = 0;
    walk(dir, &keep, &mut count);
    count
}
