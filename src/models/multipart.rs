//! Multipart upload sessions and their parts.

use super::{object::Attrs, time::Timestamp};
use serde::Serialize;
use sqlx::{FromRow, types::Json};
use std::fmt;
use uuid::Uuid;

/// `None -> Init -> InProgress -> Complete -> Aggregating -> Done`, with
/// `Aborted` reachable from any state before `Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, sqlx::Type)]
#[repr(i32)]
pub enum MultipartState {
    None = 0,
    Init = 1,
    InProgress = 2,
    Complete = 3,
    Aggregating = 4,
    Done = 5,
    Aborted = 6,
}

impl fmt::Display for MultipartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MultipartState::None => "NONE",
            MultipartState::Init => "INIT",
            MultipartState::InProgress => "INPROGRESS",
            MultipartState::Complete => "COMPLETE",
            MultipartState::Aggregating => "AGGREGATING",
            MultipartState::Done => "DONE",
            MultipartState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// A multipart upload session.
#[derive(Clone, FromRow, Debug, Serialize)]
pub struct MultipartUpload {
    pub id: i64,

    /// Parent bucket ID.
    pub bucket_id: Uuid,

    /// Unique upload ID (returned to client).
    pub upload_id: String,

    pub state: MultipartState,
    pub state_change_time: Timestamp,

    /// Object key being uploaded.
    pub object_name: String,

    /// Roots the directory holding the part files.
    pub object_uuid: Uuid,

    /// Ordering key for upload listings.
    pub meta_str: String,

    pub owner_id: String,
    pub owner_display_name: String,

    /// Timestamp when upload was initiated.
    pub mtime: Timestamp,

    #[serde(skip)]
    pub attrs: Json<Attrs>,

    pub placement_name: String,
    pub placement_storage_class: String,
}

impl MultipartUpload {
    pub fn meta_str_for(object_name: &str, upload_id: &str) -> String {
        format!("_meta{}.{}", object_name, upload_id)
    }

    /// Still in flight from a client's point of view.
    pub fn is_available(&self) -> bool {
        matches!(
            self.state,
            MultipartState::Init | MultipartState::InProgress
        )
    }
}

/// A single part of a multipart upload session.
#[derive(Clone, FromRow, Debug, Serialize, PartialEq, Eq)]
pub struct MultipartPart {
    pub id: i64,

    /// Reference to parent upload session.
    pub upload_id: String,

    /// Part number, unique within the upload.
    pub part_num: i64,

    /// Size in bytes.
    pub size: i64,

    /// Set once the part is finished; `None` while it is still being written.
    pub etag: Option<String>,

    pub mtime: Timestamp,
}

impl MultipartPart {
    pub fn is_finished(&self) -> bool {
        self.etag.is_some()
    }
}
