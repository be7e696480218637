//! Millisecond-epoch clock helpers.
//!
//! The `$timestamp` variable in on-chain guards is a millisecond epoch;
//! every timestamp this pipeline produces uses the same unit.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as a millisecond epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
