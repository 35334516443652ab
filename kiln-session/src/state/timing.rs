use chrono::{DateTime, Utc};

/// Convert a timestamp to the epoch-millis form stored in SQLite.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Rehydrate a stored epoch-millis value. Out-of-range values collapse to the epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub fn now_millis() -> i64 {
    to_millis(Utc::now())
}

/// Calculate duration in milliseconds between two timestamps.
pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    end.signed_duration_since(start).num_milliseconds()
}
