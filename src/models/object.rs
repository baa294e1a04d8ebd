//! Objects and their versions.
//!
//! An object is only a name inside a bucket plus a stable UUID that roots its
//! payload directory. Every payload-bearing attribute lives on a [`Version`].

use super::time::Timestamp;
use serde::Serialize;
use sqlx::{FromRow, types::Json};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// Arbitrary per-version metadata (user metadata, ACL blobs, content type...).
pub type Attrs = BTreeMap<String, Vec<u8>>;

/// Lifecycle state of a version.
///
/// `Open -> Committed -> Deleted`, or `Open -> Deleted` when abandoned.
/// `Deleted` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, sqlx::Type)]
#[repr(i32)]
pub enum ObjectState {
    Open = 0,
    Committed = 1,
    Deleted = 2,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectState::Open => "OPEN",
            ObjectState::Committed => "COMMITTED",
            ObjectState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Fixed at creation time, never changes afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[repr(i32)]
pub enum VersionType {
    Regular = 0,
    DeleteMarker = 1,
}

/// A row of the `objects` table.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct ObjectRow {
    /// Stable identifier, used to derive the payload directory.
    pub uuid: Uuid,
    pub bucket_id: Uuid,
    pub name: String,
}

/// One immutable content generation of an object.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct Version {
    /// Monotonic row id assigned by the database; names the payload file.
    pub id: i64,
    /// UUID of the owning object.
    pub object_id: Uuid,
    pub checksum: String,
    pub size: i64,
    pub create_time: Timestamp,
    pub delete_time: Timestamp,
    pub commit_time: Timestamp,
    pub mtime: Timestamp,
    pub object_state: ObjectState,
    /// Client-visible version id. Empty for the implicit version of an
    /// unversioned bucket.
    pub version_id: String,
    pub etag: String,
    #[serde(skip)]
    pub attrs: Json<Attrs>,
    pub version_type: VersionType,
}

impl Version {
    /// A fresh OPEN regular version, not yet inserted.
    pub fn new_open(object_id: Uuid, version_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            object_id,
            checksum: String::new(),
            size: 0,
            create_time: Timestamp::now(),
            delete_time: Timestamp::UNSET,
            commit_time: Timestamp::UNSET,
            mtime: Timestamp::UNSET,
            object_state: ObjectState::Open,
            version_id: version_id.into(),
            etag: String::new(),
            attrs: Json(Attrs::new()),
            version_type: VersionType::Regular,
        }
    }

    /// A delete marker: committed on birth, zero payload.
    pub fn new_delete_marker(object_id: Uuid, version_id: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            create_time: now,
            delete_time: now,
            commit_time: now,
            mtime: now,
            object_state: ObjectState::Committed,
            version_type: VersionType::DeleteMarker,
            ..Self::new_open(object_id, version_id)
        }
    }

    pub fn is_delete_marker(&self) -> bool {
        self.version_type == VersionType::DeleteMarker
    }
}

/// A version joined with the name of the object it belongs to.
#[derive(Clone, Debug, FromRow)]
pub struct NamedVersion {
    pub name: String,
    pub bucket_id: Uuid,
    #[sqlx(flatten)]
    pub version: Version,
}

/// A committed version as it appears in a version listing.
#[derive(Clone, Debug, FromRow)]
pub struct VersionEntry {
    pub name: String,
    /// Newest committed version of its object.
    pub is_latest: bool,
    #[sqlx(flatten)]
    pub version: Version,
}

/// Key of a version inside a bucket: object name plus optional version id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectKey {
    pub name: String,
    pub version_id: Option<String>,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_id: None,
        }
    }

    pub fn with_version(name: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_id: Some(version_id.into()).filter(|v: &String| !v.is_empty()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_id {
            Some(v) => write!(f, "{}[{}]", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}
