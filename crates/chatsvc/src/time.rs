//! Thin wrapper around the wall clock so tests can stay deterministic
//! without threading a clock trait through every signature.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in seconds, matching the original service's
/// `tz.timestamp()` helper.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}
