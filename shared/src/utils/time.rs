//! Packet timestamps.
//!
//! Timestamps on the wire count microseconds since 2021-01-01T00:00:00Z.

use chrono::{DateTime, TimeZone, Utc};

/// Start of the packet timestamp epoch.
pub fn protocol_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Microseconds between the protocol epoch and `time`, clamped at zero.
pub fn micros_since_epoch(time: DateTime<Utc>) -> u64 {
    (time - protocol_epoch())
        .num_microseconds()
        .map_or(0, |us| us.max(0) as u64)
}

/// Current time as a packet timestamp.
pub fn protocol_timestamp() -> u64 {
    micros_since_epoch(Utc::now())
}

/// Wall-clock time of a packet timestamp.
pub fn timestamp_to_datetime(timestamp: u64) -> DateTime<Utc> {
    protocol_epoch() + chrono::Duration::microseconds(timestamp.min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_offsets() {
        assert_eq!(micros_since_epoch(protocol_epoch()), 0);
        let one_day = Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(micros_since_epoch(one_day), 86_400_000_000);
        let before = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(micros_since_epoch(before), 0);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = protocol_timestamp();
        assert!(ts > 0);
        assert_eq!(micros_since_epoch(timestamp_to_datetime(ts)), ts);
    }
}
