#![forbid(unsafe_code)]

use chrono::{DateTime, SubsecRound, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	Utc::now().timestamp_millis()
}

/// `ts` cut to the millisecond precision the database keeps.
#[inline]
pub fn to_stored_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
	ts.trunc_subsecs(3)
}

/// Unix milliseconds as stored in the database.
#[inline]
pub fn to_unix_ms(ts: DateTime<Utc>) -> i64 {
	ts.timestamp_millis()
}

/// Inverse of [`to_unix_ms`]; `None` when out of chrono's range.
#[inline]
pub fn from_unix_ms(ms: i64) -> Option<DateTime<Utc>> {
	DateTime::<Utc>::from_timestamp_millis(ms)
}
