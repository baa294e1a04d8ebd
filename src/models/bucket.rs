//! Represents a logical bucket: a top-level container for objects.

use super::{object::Attrs, time::Timestamp};
use serde::Serialize;
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// Where a bucket (or a multipart destination) places its data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub name: String,
    pub storage_class: String,
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.storage_class.is_empty()
    }
}

/// A storage bucket.
///
/// Deleting a bucket only flips `deleted`; the row and every child row are
/// removed later by the garbage collector.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Bucket name, unique among live buckets.
    pub name: String,

    /// ID of the user that owns this bucket.
    pub owner_id: String,

    pub placement_name: String,
    pub placement_storage_class: String,

    /// When this bucket was created.
    pub created_at: Timestamp,

    pub versioning_enabled: bool,

    /// Soft-delete flag.
    pub deleted: bool,

    #[serde(skip)]
    pub attrs: Json<Attrs>,
}

impl Bucket {
    pub fn placement(&self) -> Placement {
        Placement {
            name: self.placement_name.clone(),
            storage_class: self.placement_storage_class.clone(),
        }
    }
}

/// Aggregate usage of a bucket over its committed versions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub object_count: i64,
    pub size: i64,
}
