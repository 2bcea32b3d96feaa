//! Millisecond-epoch timestamps.
//!
//! Envelopes and WAL records carry `i64` millisecond epochs; persisted store
//! indexes use `chrono` RFC 3339 strings. Both derive from the same clock.

/// Current wall-clock time as a millisecond epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
