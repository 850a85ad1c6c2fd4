use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the unix epoch. Control-flow decisions use
/// `Instant`; this feeds lease expiry, rate windows and store rows, where
/// tests pass explicit values instead.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
