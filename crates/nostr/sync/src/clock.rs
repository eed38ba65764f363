use chrono::Utc;

/// Current unix time in seconds.
pub fn now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}
