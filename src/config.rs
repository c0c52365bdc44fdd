//! Process-wide scheduler configuration, read once from the environment.

use std::sync::LazyLock;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

static REPLICATION_MONITOR_INTERVAL_MS: LazyLock<u64> =
    LazyLock::new(|| env_u64("REPLICATION_MONITOR_INTERVAL_MS", 15_000));

static MONITOR_INTERVAL_MS: LazyLock<u64> = LazyLock::new(|| env_u64("MONITOR_INTERVAL_MS", 200));

static CONC_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_usize("CONC_THREADS", (num_cpus::get() + 2) / 2));

static REPLICATION_EVENT_PAUSE_TIME: LazyLock<u64> =
    LazyLock::new(|| env_u64("REPLICATION_EVENT_PAUSE_TIME", 20));

static DEBUG: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("SPINDLE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

/// Observation window for replication and concurrent-loop stall detection.
pub fn replication_monitor_interval_ms() -> u64 {
    *REPLICATION_MONITOR_INTERVAL_MS
}

/// Observation window for core-loop stall detection.
pub fn monitor_interval_ms() -> u64 {
    *MONITOR_INTERVAL_MS
}

/// Size of the concurrent-loop pool.
pub fn conc_threads() -> usize {
    (*CONC_THREADS).max(1)
}

/// Upper back-off in milliseconds for replication and concurrent pausers,
/// also used as the timer-tick hint for lazily created loops.
pub fn replication_event_pause_time_ms() -> u64 {
    *REPLICATION_EVENT_PAUSE_TIME
}

/// Debug mode widens pauser back-off and suppresses stall dumps.
pub fn is_debug() -> bool {
    *DEBUG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(monitor_interval_ms(), 200);
        assert_eq!(replication_monitor_interval_ms(), 15_000);
        assert_eq!(replication_event_pause_time_ms(), 20);
        assert!(conc_threads() >= 1);
        assert!(!is_debug());
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_u64("SPINDLE_TEST_UNSET_VAR", 7), 7);
        assert_eq!(env_usize("SPINDLE_TEST_UNSET_VAR", 3), 3);
    }
}
