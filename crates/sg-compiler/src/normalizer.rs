//! Entry normalization
//!
//! Turns whatever the UI stored under `blockedEntries` into the canonical,
//! deduplicated entry list the compiler consumes. Invalid items are dropped
//! silently; nothing in here returns an error.

use std::collections::HashMap;

use serde_json::{Map, Value};

use sg_core::config::EngineConfig;
use sg_core::expiry::parse_expiry;
use sg_core::types::{Entry, EntryAction, EntryKey, EntryType};
use sg_core::url::canonical_domain;

/// Normalization counters, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub raw: usize,
    pub dropped: usize,
    pub merged: usize,
    pub truncated: usize,
}

/// Normalize a stored entry collection.
///
/// Accepts a JSON array, or an object whose values are entries. Entries
/// sharing a key are merged last-write-wins at the position of the first
/// occurrence. The result is capped at `config.max_entries`.
pub fn normalize(raw: &Value, config: &EngineConfig) -> Vec<Entry> {
    normalize_with_stats(raw, config).0
}

pub fn normalize_with_stats(raw: &Value, config: &EngineConfig) -> (Vec<Entry>, NormalizeStats) {
    let items: Vec<&Value> = match raw {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };

    let mut stats = NormalizeStats {
        raw: items.len(),
        ..NormalizeStats::default()
    };
    let mut entries: Vec<Entry> = Vec::with_capacity(items.len());
    let mut positions: HashMap<EntryKey, usize> = HashMap::new();

    for item in items {
        let entry = match normalize_entry(item, config) {
            Some(entry) => entry,
            None => {
                stats.dropped += 1;
                continue;
            }
        };

        let key = entry.key();
        match positions.get(&key) {
            Some(&pos) => {
                entries[pos] = entry;
                stats.merged += 1;
            }
            None => {
                positions.insert(key, entries.len());
                entries.push(entry);
            }
        }
    }

    if entries.len() > config.max_entries {
        stats.truncated = entries.len() - config.max_entries;
        entries.truncate(config.max_entries);
    }

    if stats.dropped > 0 || stats.truncated > 0 {
        log::debug!(
            "Normalized {} raw entries: {} dropped, {} merged, {} truncated",
            stats.raw,
            stats.dropped,
            stats.merged,
            stats.truncated
        );
    }

    (entries, stats)
}

/// Normalize a single stored item. Returns `None` when the item is not an
/// object, has no usable value, or fails host validation.
pub fn normalize_entry(item: &Value, config: &EngineConfig) -> Option<Entry> {
    let obj = item.as_object()?;

    let raw_value = obj.get("value").and_then(Value::as_str)?.trim();
    if raw_value.is_empty() {
        return None;
    }

    let kind = match obj.get("type") {
        Some(Value::String(s)) => EntryType::from_name(s)?,
        Some(Value::Null) | None => EntryType::Domain,
        Some(_) => return None,
    };

    let value = match kind {
        EntryType::Domain => canonical_domain(raw_value)?,
        EntryType::Pattern => raw_value.to_string(),
    };

    let action = parse_action(obj);
    let selectors = match action {
        EntryAction::HideElements => Some(parse_selectors(obj, config.max_selectors)),
        EntryAction::Block => None,
    };

    Some(Entry {
        kind,
        value,
        action,
        expires_at: obj.get("expiresAt").and_then(parse_expiry),
        requires_master_pin: obj.get("requiresMasterPin").map(is_truthy).unwrap_or(false),
        selectors,
    })
}

fn parse_action(obj: &Map<String, Value>) -> EntryAction {
    match obj.get("action").and_then(Value::as_str) {
        Some(s) if s.trim().eq_ignore_ascii_case("hide-elements") => EntryAction::HideElements,
        _ => EntryAction::Block,
    }
}

/// Trimmed, non-empty, unique selectors in first-seen order.
fn parse_selectors(obj: &Map<String, Value>, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let items = match obj.get("selectors") {
        Some(Value::Array(items)) => items,
        _ => return out,
    };

    for item in items {
        if out.len() >= max {
            break;
        }
        let selector = match item.as_str() {
            Some(s) => s.trim(),
            None => continue,
        };
        if selector.is_empty() || out.iter().any(|s| s == selector) {
            continue;
        }
        out.push(selector.to_string());
    }

    out
}

/// Loose boolean coercion for flags written by older UIs.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        _ => false,
    }
}
