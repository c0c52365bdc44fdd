//! Wall-clock millisecond time source shared by workers and monitors.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Real timestamps never collide with the loop-state sentinels
/// ([`crate::LOOP_IDLE`], [`crate::LOOP_TERMINATED`], and `0` for quiet).
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
