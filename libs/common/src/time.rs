//! Wall-clock helpers shared by the cache, bus and script libraries

use chrono::{Local, Utc};

/// Milliseconds since the UNIX epoch
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Seconds since the UNIX epoch
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Local time as `2006-01-02 15:04:05`
pub fn local_datetime() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Local time with milliseconds
pub fn local_datetime_ms() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_helpers_are_consistent() {
        let ms = now_ms();
        let secs = now_secs();
        assert!(ms / 1000 >= secs.saturating_sub(1));
        assert_eq!(local_datetime().len(), 19);
        assert_eq!(local_datetime_ms().len(), 23);
    }
}
