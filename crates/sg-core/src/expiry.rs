//! Expiry instants
//!
//! Entries may carry an absolute `expiresAt`. Stored values come from a UI
//! that is not always careful, so parsing is lenient and failure simply
//! means "indefinite".

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::Entry;

/// Largest delay an in-process timer accepts (signed 32-bit milliseconds).
pub const MAX_TIMER_DELAY_MS: u64 = i32::MAX as u64;

/// Latest storable instant, 9999-12-31T23:59:59.999Z. Later instants have no
/// four-digit-year RFC 3339 form and would not parse back.
pub const MAX_EXPIRY_MS: i64 = 253_402_300_799_999;

/// Parse a stored `expiresAt` value.
///
/// Accepts RFC 3339 / RFC 2822 strings and epoch milliseconds, either as a
/// JSON number or as a numeric string. Instants are truncated to whole
/// milliseconds so that re-parsing a serialized instant is lossless.
pub fn parse_expiry(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_expiry_str(s),
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(ms) => ms,
                None => {
                    let ms = n.as_f64()?;
                    if !ms.is_finite() {
                        return None;
                    }
                    ms.trunc() as i64
                }
            };
            from_millis(millis)
        }
        _ => None,
    }
}

pub fn parse_expiry_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(millis) = s.parse::<i64>() {
        return from_millis(millis);
    }

    let parsed = DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()?;
    from_millis(parsed.timestamp_millis())
}

/// Clamp into `[1970-01-01, MAX_EXPIRY_MS]`. Anything before the epoch is
/// long expired either way, and clamping the far end keeps the entry
/// time-boxed instead of letting it fall back to indefinite on re-read.
fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis.clamp(0, MAX_EXPIRY_MS))
}

/// An entry is active until its expiry instant has passed.
#[inline]
pub fn is_active(entry: &Entry, now: DateTime<Utc>) -> bool {
    match entry.expires_at {
        Some(at) => at > now,
        None => true,
    }
}

/// Earliest expiry instant across `entries`, if any carries one.
pub fn next_expiry<'a, I>(entries: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = &'a Entry>,
{
    entries.into_iter().filter_map(|e| e.expires_at).min()
}

/// Delay from `now` until `at`, clamped to what an in-process timer can hold.
pub fn clamp_delay(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    match (at - now).to_std() {
        Ok(delay) => delay.min(Duration::from_millis(MAX_TIMER_DELAY_MS)),
        Err(_) => Duration::ZERO,
    }
}
