//! Payload path derivation.
//!
//! An object's UUID is spread over two levels of hex-prefix directories to
//! keep per-directory entry counts low:
//!
//! ```text
//! 3f/a2/9c4e...<rest of uuid>/17.v     version with row id 17
//! 3f/a2/9c4e...<rest of uuid>/3.p      part 3 of an upload
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory holding every file derived from `uuid`, relative to the data root.
pub fn object_dir(uuid: &Uuid) -> PathBuf {
    let hex = uuid.simple().to_string();
    let mut path = PathBuf::from(&hex[0..2]);
    path.push(&hex[2..4]);
    path.push(&hex[4..]);
    path
}

pub fn version_path(uuid: &Uuid, version_row_id: i64) -> PathBuf {
    object_dir(uuid).join(format!("{}.v", version_row_id))
}

pub fn part_path(upload_object_uuid: &Uuid, part_num: i64) -> PathBuf {
    object_dir(upload_object_uuid).join(format!("{}.p", part_num))
}

/// Scratch file used while concatenating parts.
pub fn aggregate_path(upload_object_uuid: &Uuid) -> PathBuf {
    object_dir(upload_object_uuid).join(format!("{}.m", Uuid::new_v4().simple()))
}

/// Remove `start` and its parents while they are empty, never touching `stop`.
pub async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match tokio::fs::remove_dir(&current).await {
            Ok(_) => match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            },
            Err(err) => {
                if !matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                ) {
                    tracing::debug!("failed to prune directory {}: {}", current.display(), err);
                }
                break;
            }
        }
    }
}
