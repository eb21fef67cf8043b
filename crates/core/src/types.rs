/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Milliseconds since the Unix epoch, the unit used by wire timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
