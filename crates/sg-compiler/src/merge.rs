//! Entry list mutations
//!
//! The normalizer only knows last-write-wins. Adding an entry through the UI
//! goes through [`upsert_entry`] instead, which is the one place that keeps
//! the longer duration when a key is declared twice.

use chrono::{DateTime, Utc};

use sg_core::expiry::is_active;
use sg_core::types::{Entry, EntryKey};

/// Result of [`upsert_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

/// Error type for entry removal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoveError {
    #[error("No entry with key {0}")]
    NotFound(EntryKey),
    #[error("Entry {0} requires the master PIN to remove")]
    Protected(EntryKey),
}

/// Merge an incoming declaration into an existing one with the same key.
///
/// Incoming fields win, except:
/// - `expiresAt` keeps the later instant, and an indefinite side makes the
///   result indefinite;
/// - `requiresMasterPin` stays set once either side sets it.
pub fn merge_entry(existing: &Entry, incoming: Entry) -> Entry {
    let expires_at = match (existing.expires_at, incoming.expires_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    };

    Entry {
        expires_at,
        requires_master_pin: existing.requires_master_pin || incoming.requires_master_pin,
        ..incoming
    }
}

/// Insert `incoming`, or merge it in place over the entry with the same key.
pub fn upsert_entry(entries: &mut Vec<Entry>, incoming: Entry) -> UpsertOutcome {
    let key = incoming.key();
    match entries.iter().position(|e| e.key() == key) {
        Some(pos) => {
            let merged = merge_entry(&entries[pos], incoming);
            entries[pos] = merged;
            UpsertOutcome::Merged
        }
        None => {
            entries.push(incoming);
            UpsertOutcome::Inserted
        }
    }
}

/// Remove the entry with `key`.
///
/// Protected entries are only removed once the caller has completed the PIN
/// check and passes `pin_verified = true`.
pub fn remove_entry(
    entries: &mut Vec<Entry>,
    key: &EntryKey,
    pin_verified: bool,
) -> Result<Entry, RemoveError> {
    let pos = entries
        .iter()
        .position(|e| &e.key() == key)
        .ok_or_else(|| RemoveError::NotFound(key.clone()))?;

    if entries[pos].requires_master_pin && !pin_verified {
        return Err(RemoveError::Protected(key.clone()));
    }

    Ok(entries.remove(pos))
}

/// Active hide-elements entries, for the element-suppression collaborator.
pub fn hide_element_entries(entries: &[Entry], now: DateTime<Utc>) -> Vec<&Entry> {
    entries
        .iter()
        .filter(|e| e.is_hide_elements() && is_active(e, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use sg_core::types::EntryAction;

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    #[test]
    fn merge_keeps_longest_duration() {
        let existing = Entry::domain("a.com").with_expiry(t(5));
        let incoming = Entry::domain("a.com").with_expiry(t(2));
        assert_eq!(merge_entry(&existing, incoming.clone()).expires_at, Some(t(5)));
        assert_eq!(merge_entry(&incoming, existing).expires_at, Some(t(5)));
    }

    #[test]
    fn merge_with_indefinite_is_indefinite() {
        let timed = Entry::domain("a.com").with_expiry(t(5));
        let forever = Entry::domain("a.com");
        assert_eq!(merge_entry(&timed, forever.clone()).expires_at, None);
        assert_eq!(merge_entry(&forever, timed).expires_at, None);
    }

    #[test]
    fn merge_keeps_protection_and_takes_incoming_action() {
        let mut existing = Entry::domain("a.com");
        existing.requires_master_pin = true;
        let mut incoming = Entry::domain("a.com");
        incoming.action = EntryAction::HideElements;
        incoming.selectors = Some(vec![".ad".into()]);

        let merged = merge_entry(&existing, incoming);
        assert!(merged.requires_master_pin);
        assert_eq!(merged.action, EntryAction::HideElements);
        assert_eq!(merged.selectors, Some(vec![".ad".to_string()]));
    }

    #[test]
    fn upsert_merges_in_place() {
        let mut entries = vec![
            Entry::domain("a.com").with_expiry(t(1)),
            Entry::domain("b.com"),
        ];
        assert_eq!(
            upsert_entry(&mut entries, Entry::domain("a.com").with_expiry(t(3))),
            UpsertOutcome::Merged
        );
        assert_eq!(upsert_entry(&mut entries, Entry::pattern("*ads*")), UpsertOutcome::Inserted);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].expires_at, Some(t(3)));
        assert_eq!(entries[2].value, "*ads*");
    }

    #[test]
    fn remove_respects_protection() {
        let mut protected = Entry::domain("a.com");
        protected.requires_master_pin = true;
        let mut entries = vec![protected, Entry::domain("b.com")];

        let key = EntryKey::from("domain:a.com");
        assert_eq!(
            remove_entry(&mut entries, &key, false),
            Err(RemoveError::Protected(key.clone()))
        );
        assert!(remove_entry(&mut entries, &key, true).is_ok());
        assert!(remove_entry(&mut entries, &EntryKey::from("domain:b.com"), false).is_ok());
        assert_eq!(
            remove_entry(&mut entries, &key, true),
            Err(RemoveError::NotFound(key))
        );
        assert!(entries.is_empty());
    }

    #[test]
    fn hide_view_filters_action_and_expiry() {
        let mut hide = Entry::domain("a.com");
        hide.action = EntryAction::HideElements;
        let mut expired = hide.clone().with_expiry(t(-1));
        expired.value = "b.com".into();
        let entries = vec![hide, expired, Entry::domain("c.com")];

        let view = hide_element_entries(&entries, t(0));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].value, "a.com");
    }
}
