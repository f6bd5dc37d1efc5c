//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the crate.

pub mod retry;

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time as epoch milliseconds (the wire timestamp format)
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds from the wire into a UTC timestamp
///
/// Out-of-range values fall back to the Unix epoch rather than failing, since
/// timestamps only feed staleness decisions.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Short random suffix for generated instance identifiers
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
