//! Timestamps as persisted in the metadata database.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// A point in time stored as nanoseconds since the Unix epoch.
///
/// Zero means "unset": a version that was never committed has an unset
/// `commit_time`, an unfinished part has an unset `mtime`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(
                f,
                "{}",
                self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true)
            )
        } else {
            write!(f, "-")
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_set() {
            serializer.serialize_some(
                &self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true),
            )
        } else {
            serializer.serialize_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_is_zero_and_orders_first() {
        let now = Timestamp::now();
        assert!(!Timestamp::UNSET.is_set());
        assert!(now.is_set());
        assert!(Timestamp::UNSET < now);
        assert_eq!(Timestamp::default(), Timestamp::UNSET);
    }

    #[test]
    fn converts_from_chrono() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ts = Timestamp::from(dt);
        assert_eq!(ts.to_datetime(), dt);
        assert_eq!(ts.to_string(), "2024-05-01T12:00:00.000Z");
    }
}
