//! Replay-window checks.

use souk_types::REPLAY_WINDOW_MS;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether `timestamp_ms` lies within the replay window around `now_ms`.
///
/// Timestamps in the future are tolerated by the same margin to absorb
/// clock skew between servers.
pub fn is_fresh(timestamp_ms: i64, now_ms: i64) -> bool {
    now_ms.abs_diff(timestamp_ms) <= REPLAY_WINDOW_MS.unsigned_abs()
}
