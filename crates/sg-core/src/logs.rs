//! Log bucket operations
//!
//! Pure read-modify-write helpers over [`LogBuckets`]. Serializing the
//! writers is the engine's job; everything here assumes exclusive access.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::types::{EntryKey, LogBucket, LogBuckets, LogRecord};

/// Record one hit on `site` into `bucket`.
///
/// A repeated site bumps its count and refreshes the sample URL and
/// timestamp. The bucket is then re-sorted most-recent-first and
/// truncated to `max_records`.
pub fn record_hit(
    bucket: &mut LogBucket,
    site: &str,
    url: &str,
    at: DateTime<Utc>,
    max_records: usize,
) {
    let record = match bucket.iter().position(|record| record.site == site) {
        Some(pos) => {
            let mut record = bucket.remove(pos);
            record.count = record.count.saturating_add(1);
            record.last_blocked_at = at;
            record.sample_url = url.to_string();
            record
        }
        None => LogRecord {
            site: site.to_string(),
            sample_url: url.to_string(),
            count: 1,
            last_blocked_at: at,
        },
    };

    // The touched record goes first so it wins ties in the stable sort.
    bucket.insert(0, record);
    bucket.sort_by(|a, b| b.last_blocked_at.cmp(&a.last_blocked_at));
    bucket.truncate(max_records);
}

/// Keep only buckets whose key is active. Returns the kept buckets and the
/// number dropped.
pub fn prune_buckets(logs: LogBuckets, active: &HashSet<EntryKey>) -> (LogBuckets, usize) {
    let before = logs.len();
    let kept: LogBuckets = logs
        .into_iter()
        .filter(|(key, _)| active.contains(key))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
