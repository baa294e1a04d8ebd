//! Capability traits the protocol layer drives, and their implementations
//! for plain objects.
//!
//! Multipart parts implement [`Writer`] too, see
//! [`crate::services::multipart_service::PartWriter`].

use crate::{
    models::object::{Attrs, ObjectKey, Version},
    services::{
        bucket::{BucketHandle, DeleteResult},
        version::{CommitInfo, ObjectVersion},
    },
    store::error::{StorageError, StorageResult},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{future::Future, io, path::PathBuf, sync::Arc};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::warn;

/// Read access to a committed version.
pub trait ReadOp {
    fn version(&self) -> &Version;

    /// Open the payload for streaming.
    fn open(&self) -> impl Future<Output = StorageResult<File>> + Send;
}

pub trait DeleteOp {
    fn delete(&self) -> impl Future<Output = StorageResult<DeleteResult>> + Send;
}

/// Streaming writer: `prepare`, any number of `process` calls, then either
/// `complete` or `abort`.
pub trait Writer {
    type Output;

    fn prepare(&mut self) -> impl Future<Output = StorageResult<()>> + Send;

    fn process(&mut self, data: &[u8]) -> impl Future<Output = StorageResult<()>> + Send;

    fn complete(self) -> impl Future<Output = StorageResult<Self::Output>> + Send;

    fn abort(self) -> impl Future<Output = StorageResult<()>> + Send;
}

/// Drive `writer` through a byte stream.
pub async fn write_stream<W, S>(mut writer: W, stream: S) -> StorageResult<W::Output>
where
    W: Writer,
    S: Stream<Item = io::Result<Bytes>>,
{
    writer.prepare().await?;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let step = match chunk {
            Ok(chunk) => writer.process(&chunk).await,
            Err(err) => Err(StorageError::Io(err)),
        };
        if let Err(err) = step {
            if let Err(abort_err) = writer.abort().await {
                warn!("failed to abort writer: {}", abort_err);
            }
            return Err(err);
        }
    }
    writer.complete().await
}

/// Payload file being written, with its running size and MD5.
pub(crate) struct PayloadFile {
    path: PathBuf,
    file: File,
    size: i64,
    digest: Context,
}

impl PayloadFile {
    pub(crate) async fn create(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file,
            size: 0,
            digest: Context::new(),
        })
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.write_all(data).await?;
        self.digest.consume(data);
        self.size += data.len() as i64;
        Ok(())
    }

    /// Flush to disk and return `(size, hex md5)`.
    pub(crate) async fn finish(mut self) -> StorageResult<(i64, String)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok((self.size, format!("{:x}", self.digest.compute())))
    }

    pub(crate) async fn discard(self) {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.path.display(), err);
            }
        }
    }
}

/// Result of a completed object write.
#[derive(Clone, Debug)]
pub struct WriteResult {
    pub version_id: String,
    pub etag: String,
    pub size: i64,
}

/// Writes a new version of an object and commits it.
pub struct ObjectWriter {
    bucket: Arc<BucketHandle>,
    name: String,
    version_id: Option<String>,
    attrs: Attrs,
    version: Option<ObjectVersion>,
    file: Option<PayloadFile>,
}

impl ObjectWriter {
    pub fn new(bucket: Arc<BucketHandle>, name: impl Into<String>) -> Self {
        Self {
            bucket,
            name: name.into(),
            version_id: None,
            attrs: Attrs::new(),
            version: None,
            file: None,
        }
    }

    /// Use an explicit version id instead of generating one.
    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    fn not_prepared() -> StorageError {
        StorageError::Io(io::Error::other("writer used before prepare"))
    }
}

impl Writer for ObjectWriter {
    type Output = WriteResult;

    async fn prepare(&mut self) -> StorageResult<()> {
        self.bucket.context().ensure_free_space()?;
        let mut version = self
            .bucket
            .create_version(&self.name, self.version_id.as_deref())
            .await?;
        *version.attrs_mut() = std::mem::take(&mut self.attrs);
        self.file = Some(PayloadFile::create(version.path()).await?);
        self.version = Some(version);
        Ok(())
    }

    async fn process(&mut self, data: &[u8]) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or_else(Self::not_prepared)?;
        file.write(data).await
    }

    async fn complete(mut self) -> StorageResult<WriteResult> {
        let (Some(file), Some(mut version)) = (self.file.take(), self.version.take()) else {
            return Err(Self::not_prepared());
        };
        let (size, etag) = file.finish().await?;
        let committed = version
            .commit(CommitInfo {
                size,
                etag: etag.clone(),
                checksum: etag.clone(),
            })
            .await?;
        if !committed {
            // The payload is left for the collector with its DELETED row.
            version.mark_deleted().await?;
            return Err(StorageError::CommitConflict(self.name));
        }
        Ok(WriteResult {
            version_id: version.version_id().to_string(),
            etag,
            size,
        })
    }

    async fn abort(mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.discard().await;
        }
        if let Some(mut version) = self.version.take() {
            version.mark_deleted().await?;
        }
        Ok(())
    }
}

/// Streams the payload of a committed version.
pub struct ObjectReader {
    version: ObjectVersion,
}

impl ObjectReader {
    pub async fn open_key(bucket: &Arc<BucketHandle>, key: &ObjectKey) -> StorageResult<Self> {
        Ok(Self {
            version: bucket.get(key).await?,
        })
    }

    pub fn object_version(&self) -> &ObjectVersion {
        &self.version
    }
}

impl ReadOp for ObjectReader {
    fn version(&self) -> &Version {
        self.version.version()
    }

    async fn open(&self) -> StorageResult<File> {
        let path = self.version.path();
        File::open(&path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::object_not_found(&self.version.bucket().name(), self.version.name())
            } else {
                StorageError::Io(err)
            }
        })
    }
}

pub struct ObjectDeleter {
    bucket: Arc<BucketHandle>,
    key: ObjectKey,
}

impl ObjectDeleter {
    pub fn new(bucket: Arc<BucketHandle>, key: ObjectKey) -> Self {
        Self { bucket, key }
    }
}

impl DeleteOp for ObjectDeleter {
    async fn delete(&self) -> StorageResult<DeleteResult> {
        self.bucket.delete(&self.key).await
    }
}
