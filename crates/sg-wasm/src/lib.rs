//! WebAssembly bindings for SiteGate
//!
//! The extension's service worker owns storage, the declarative rule set and
//! alarms; these bindings give it the pure pieces of the engine. Everything
//! crosses the boundary as JSON text in the same camelCase shapes that are
//! persisted in extension storage.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use wasm_bindgen::prelude::*;

use sg_compiler::{
    compile, hide_element_entries, normalize, normalize_with_stats, translate, upsert_entry,
    UpsertOutcome,
};
use sg_compiler::normalizer::normalize_entry;
use sg_core::{
    config::EngineConfig,
    expiry::{is_active, next_expiry},
    logs::record_hit,
    types::{LogBuckets, RuleIdMap},
    url::{extract_host, site_for_url},
};

// =============================================================================
// Exports
// =============================================================================

#[wasm_bindgen]
pub fn translate_pattern(pattern: &str) -> String {
    translate(pattern)
}

/// Normalize a stored entry list. Returns `{entries, raw, dropped, merged,
/// truncated}`.
#[wasm_bindgen]
pub fn normalize_entries(entries_json: &str, config_json: Option<String>) -> Result<JsValue, JsValue> {
    let config = load_config(config_json)?;
    let raw = parse_json(entries_json, "entries")?;
    to_js(&normalize_report(&raw, &config))
}

/// Normalize, drop expired entries and compile. Returns `{rules,
/// ruleIdToEntryKey, activeEntries, expiredEntries, truncated, nextExpiry}`.
#[wasm_bindgen]
pub fn compile_entries(entries_json: &str, config_json: Option<String>) -> Result<JsValue, JsValue> {
    let config = load_config(config_json)?;
    let raw = parse_json(entries_json, "entries")?;
    to_js(&compile_report(&raw, &config, js_now()?))
}

/// Add `incoming_json` to the entry list, keeping the longer duration when
/// the key already exists. Returns `{entries, outcome}`.
#[wasm_bindgen]
pub fn merge_entries(
    entries_json: &str,
    incoming_json: &str,
    config_json: Option<String>,
) -> Result<JsValue, JsValue> {
    let config = load_config(config_json)?;
    let raw = parse_json(entries_json, "entries")?;
    let incoming = parse_json(incoming_json, "incoming entry")?;
    let merged = merge_report(&raw, &incoming, &config).map_err(|e| JsValue::from_str(&e))?;
    to_js(&merged)
}

/// Active hide-elements entries of a stored entry list.
#[wasm_bindgen]
pub fn hidden_element_entries(entries_json: &str) -> Result<JsValue, JsValue> {
    let raw = parse_json(entries_json, "entries")?;
    let entries = normalize(&raw, &EngineConfig::default());
    let hidden = hide_element_entries(&entries, js_now()?);
    to_js(&json!(hidden))
}

/// Apply one rule-matched notification to stored logs. Returns the updated
/// logs, or `null` when the rule id is not in the mapping.
#[wasm_bindgen]
pub fn apply_rule_match(
    logs_json: &str,
    rule_map_json: &str,
    rule_id: f64,
    url: &str,
    config_json: Option<String>,
) -> Result<JsValue, JsValue> {
    let config = load_config(config_json)?;
    let logs: LogBuckets = serde_json::from_str(logs_json).unwrap_or_default();
    let rule_map: RuleIdMap = serde_json::from_str(rule_map_json).unwrap_or_default();

    match hit_report(logs, &rule_map, rule_id, url, js_now()?, &config) {
        Some(logs) => to_js(&json!(logs)),
        None => Ok(JsValue::NULL),
    }
}

#[wasm_bindgen]
pub fn site_for_url_js(url: &str) -> String {
    site_for_url(url)
}

#[wasm_bindgen]
pub fn extract_host_js(url: &str) -> Option<String> {
    extract_host(url).map(|s| s.to_string())
}

// =============================================================================
// JSON-level implementations
// =============================================================================

fn normalize_report(raw: &Value, config: &EngineConfig) -> Value {
    let (entries, stats) = normalize_with_stats(raw, config);
    json!({
        "entries": entries,
        "raw": stats.raw,
        "dropped": stats.dropped,
        "merged": stats.merged,
        "truncated": stats.truncated,
    })
}

fn compile_report(raw: &Value, config: &EngineConfig, now: DateTime<Utc>) -> Value {
    let (active, expired): (Vec<_>, Vec<_>) = normalize(raw, config)
        .into_iter()
        .partition(|e| is_active(e, now));
    let compilation = compile(&active, config);

    json!({
        "rules": compilation.rules,
        "ruleIdToEntryKey": compilation.rule_map,
        "activeEntries": active,
        "expiredEntries": expired.len(),
        "truncated": compilation.truncated,
        "nextExpiry": next_expiry(&active),
    })
}

fn merge_report(raw: &Value, incoming: &Value, config: &EngineConfig) -> Result<Value, String> {
    let incoming = normalize_entry(incoming, config)
        .ok_or_else(|| format!("Invalid entry: {}", incoming))?;
    let mut entries = normalize(raw, config);
    let outcome = match upsert_entry(&mut entries, incoming) {
        UpsertOutcome::Inserted => "inserted",
        UpsertOutcome::Merged => "merged",
    };
    Ok(json!({ "entries": entries, "outcome": outcome }))
}

fn hit_report(
    mut logs: LogBuckets,
    rule_map: &RuleIdMap,
    rule_id: f64,
    url: &str,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Option<LogBuckets> {
    if !(rule_id.is_finite() && rule_id.fract() == 0.0 && rule_id >= 0.0 && rule_id <= u32::MAX as f64) {
        return None;
    }
    if url.trim().is_empty() {
        return None;
    }

    let key = rule_map.get(&(rule_id as u32))?.clone();
    let bucket = logs.entry(key).or_default();
    record_hit(bucket, &site_for_url(url), url, now, config.max_bucket_records);
    Some(logs)
}

// =============================================================================
// Boundary helpers
// =============================================================================

fn load_config(config_json: Option<String>) -> Result<EngineConfig, JsValue> {
    match config_json {
        Some(text) if !text.trim().is_empty() => EngineConfig::from_json(&text)
            .map_err(|e| JsValue::from_str(&format!("Failed to load config: {}", e))),
        _ => Ok(EngineConfig::default()),
    }
}

fn parse_json(text: &str, what: &str) -> Result<Value, JsValue> {
    serde_json::from_str(text).map_err(|e| {
        let message = format!("Failed to parse {}: {}", what, e);
        web_sys::console::warn_1(&JsValue::from_str(&message));
        JsValue::from_str(&message)
    })
}

fn to_js(value: &Value) -> Result<JsValue, JsValue> {
    js_sys::JSON::parse(&value.to_string())
}

/// `Utc::now()` has no clock on wasm32-unknown-unknown; ask the JS host.
fn js_now() -> Result<DateTime<Utc>, JsValue> {
    let millis = js_sys::Date::now();
    DateTime::from_timestamp_millis(millis as i64)
        .ok_or_else(|| JsValue::from_str("Host clock out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sg_core::types::EntryKey;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn compile_report_skips_expired() {
        let raw = json!([
            {"type": "domain", "value": "old.com", "expiresAt": "2029-12-31T00:00:00Z"},
            {"type": "domain", "value": "example.com", "expiresAt": "2030-01-02T00:00:00Z"},
            {"type": "pattern", "value": "*://*/ads/*"},
        ]);
        let report = compile_report(&raw, &EngineConfig::default(), now());

        assert_eq!(report["rules"].as_array().map(Vec::len), Some(4));
        assert_eq!(report["expiredEntries"], 1);
        assert_eq!(report["ruleIdToEntryKey"]["1000"], "domain:example.com");
        assert_eq!(report["ruleIdToEntryKey"]["1003"], "pattern:*://*/ads/*");
        assert_eq!(report["rules"][0]["condition"]["urlFilter"], "||example.com^");
        assert!(report["nextExpiry"].is_string());
    }

    #[test]
    fn merge_report_keeps_longer_duration() {
        let raw = json!([{"type": "domain", "value": "a.com", "expiresAt": "2030-06-01T00:00:00Z"}]);
        let incoming = json!({"type": "domain", "value": "https://www.a.com/x", "expiresAt": "2030-02-01T00:00:00Z"});
        let report = merge_report(&raw, &incoming, &EngineConfig::default()).unwrap();

        assert_eq!(report["outcome"], "merged");
        assert_eq!(report["entries"].as_array().map(Vec::len), Some(1));
        let kept = report["entries"][0]["expiresAt"].as_str().unwrap();
        assert!(kept.starts_with("2030-06-01"));

        assert!(merge_report(&raw, &json!({"value": ""}), &EngineConfig::default()).is_err());
    }

    #[test]
    fn hit_report_ignores_stale_and_malformed() {
        let mut rule_map = RuleIdMap::new();
        rule_map.insert(1000, "domain:a.com".into());
        let config = EngineConfig::default();

        let logs = hit_report(LogBuckets::new(), &rule_map, 1000.0, "https://x.a.com/", now(), &config)
            .unwrap();
        assert_eq!(logs[&EntryKey::from("domain:a.com")][0].site, "x.a.com");

        assert!(hit_report(LogBuckets::new(), &rule_map, 1001.0, "https://a.com/", now(), &config).is_none());
        assert!(hit_report(LogBuckets::new(), &rule_map, 1000.5, "https://a.com/", now(), &config).is_none());
        assert!(hit_report(LogBuckets::new(), &rule_map, -1.0, "https://a.com/", now(), &config).is_none());
        assert!(hit_report(LogBuckets::new(), &rule_map, 1000.0, " ", now(), &config).is_none());
    }

    #[test]
    fn normalize_report_counts_drops() {
        let raw = json!([
            {"type": "domain", "value": "a.com"},
            {"type": "domain", "value": "www.a.com"},
            {"type": "domain", "value": "bad host"},
            "junk",
        ]);
        let report = normalize_report(&raw, &EngineConfig::default());
        assert_eq!(report["entries"].as_array().map(Vec::len), Some(1));
        assert_eq!(report["raw"], 4);
    }
}
