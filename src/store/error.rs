//! Error taxonomy of the storage engine and the classification used by the
//! retry wrapper.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("no such upload `{0}`")]
    NoSuchUpload(String),
    #[error("upload `{0}` already exists")]
    UploadAlreadyExists(String),
    #[error("invalid part {part_num}: {reason}")]
    InvalidPart { part_num: i64, reason: String },
    #[error("part {part_num} is smaller than the minimum part size")]
    PartTooSmall { part_num: i64 },
    #[error("commit of `{0}` lost to a concurrent writer")]
    CommitConflict(String),
    #[error("not enough free space on the data volume")]
    QuotaExceeded,
    #[error("giving up after {retries} retries: {last_error}")]
    RetriesExhausted { retries: u32, last_error: String },
    #[error("incompatible metadata schema: {0}")]
    IncompatibleSchema(String),
    #[error("metadata inconsistency: {0}")]
    Inconsistency(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn object_not_found(bucket: &str, key: &str) -> Self {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Errors in this class must never be retried and should stop the
    /// operation loudly.
    pub fn is_critical(&self) -> bool {
        self.classify() == ErrorClass::Critical
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BucketNotFound(_)
                | StorageError::ObjectNotFound { .. }
                | StorageError::NoSuchUpload(_)
        )
    }
}

/// How the retry wrapper treats an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lock contention; the unit of work is re-run.
    Busy,
    /// Corruption, schema mismatch, disk failure or a broken invariant.
    Critical,
    /// Anything else; handed back to the caller untouched.
    Other,
}

pub trait ClassifyError {
    fn classify(&self) -> ErrorClass;
}

// Primary SQLite result codes.
const SQLITE_ERROR: i64 = 1;
const SQLITE_INTERNAL: i64 = 2;
const SQLITE_PERM: i64 = 3;
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_NOMEM: i64 = 7;
const SQLITE_READONLY: i64 = 8;
const SQLITE_IOERR: i64 = 10;
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTFOUND: i64 = 12;
const SQLITE_FULL: i64 = 13;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_PROTOCOL: i64 = 15;
const SQLITE_TOOBIG: i64 = 18;
const SQLITE_MISMATCH: i64 = 20;
const SQLITE_MISUSE: i64 = 21;
const SQLITE_NOLFS: i64 = 22;
const SQLITE_AUTH: i64 = 23;
const SQLITE_RANGE: i64 = 25;
const SQLITE_NOTADB: i64 = 26;

const CRITICAL_CODES: [i64; 18] = [
    SQLITE_ERROR,
    SQLITE_INTERNAL,
    SQLITE_PERM,
    SQLITE_NOMEM,
    SQLITE_READONLY,
    SQLITE_IOERR,
    SQLITE_CORRUPT,
    SQLITE_NOTFOUND,
    SQLITE_FULL,
    SQLITE_CANTOPEN,
    SQLITE_PROTOCOL,
    SQLITE_TOOBIG,
    SQLITE_MISMATCH,
    SQLITE_MISUSE,
    SQLITE_NOLFS,
    SQLITE_AUTH,
    SQLITE_RANGE,
    SQLITE_NOTADB,
];

/// Classify a raw (possibly extended) SQLite result code.
///
/// Extended codes carry the primary code in their low byte, so
/// `SQLITE_BUSY_SNAPSHOT` and `SQLITE_IOERR_SHORT_READ` land on BUSY and
/// IOERR respectively.
pub fn classify_sqlite_code(code: i64) -> ErrorClass {
    let primary = code & 0xff;
    if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
        ErrorClass::Busy
    } else if CRITICAL_CODES.contains(&primary) {
        ErrorClass::Critical
    } else {
        ErrorClass::Other
    }
}

/// Extract the SQLite result code from a database error, if there is one.
pub fn sqlite_code(err: &sqlx::Error) -> Option<i64> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().and_then(|c| c.parse::<i64>().ok()),
        _ => None,
    }
}

impl ClassifyError for sqlx::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            sqlx::Error::PoolTimedOut => ErrorClass::Busy,
            sqlx::Error::Database(_) => sqlite_code(self)
                .map(classify_sqlite_code)
                .unwrap_or(ErrorClass::Other),
            _ => ErrorClass::Other,
        }
    }
}

impl ClassifyError for StorageError {
    fn classify(&self) -> ErrorClass {
        match self {
            StorageError::Sqlx(err) => err.classify(),
            StorageError::IncompatibleSchema(_) | StorageError::Inconsistency(_) => {
                ErrorClass::Critical
            }
            _ => ErrorClass::Other,
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
