//! Core type definitions for SiteGate
//!
//! These types are the persisted shapes shared by the compiler, the
//! lifecycle engine and the host-facing bindings. Field names serialize in
//! camelCase so the extension UI can read them straight out of storage.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

// =============================================================================
// Entries
// =============================================================================

/// Kind of user declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// A canonical host; covers the host and every subdomain.
    Domain,
    /// A raw wildcard URL pattern.
    Pattern,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Pattern => "pattern",
        }
    }

    /// Parse a stored type tag. Unknown tags yield `None`.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "domain" => Some(Self::Domain),
            "pattern" => Some(Self::Pattern),
            _ => None,
        }
    }
}

/// What an entry does once it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntryAction {
    /// Network-level blocking through compiled rules.
    #[default]
    #[serde(rename = "block")]
    Block,
    /// CSS-level suppression, realized outside the rule compiler.
    #[serde(rename = "hide-elements")]
    HideElements,
}

impl EntryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::HideElements => "hide-elements",
        }
    }
}

/// Stable identity of an entry: `type:value`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(String);

impl EntryKey {
    pub fn new(kind: EntryType, value: &str) -> Self {
        Self(format!("{}:{}", kind.as_str(), value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A canonical user declaration, as stored under `blockedEntries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub value: String,
    #[serde(default)]
    pub action: EntryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requires_master_pin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<Vec<String>>,
}

impl Entry {
    /// Indefinite block entry for a canonical host.
    pub fn domain(host: &str) -> Self {
        Self::new(EntryType::Domain, host)
    }

    /// Indefinite block entry for a wildcard pattern.
    pub fn pattern(pattern: &str) -> Self {
        Self::new(EntryType::Pattern, pattern)
    }

    fn new(kind: EntryType, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            action: EntryAction::Block,
            expires_at: None,
            requires_master_pin: false,
            selectors: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.kind, &self.value)
    }

    pub fn is_hide_elements(&self) -> bool {
        self.action == EntryAction::HideElements
    }
}

// =============================================================================
// Request Types (bit mask for resource-type scoping)
// =============================================================================

bitflags::bitflags! {
    /// Resource types a compiled rule applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestType: u32 {
        const MAIN_FRAME = 1 << 0;   // top-level navigation
        const SUB_FRAME = 1 << 1;    // iframe/frame
        const STYLESHEET = 1 << 2;
        const SCRIPT = 1 << 3;
        const IMAGE = 1 << 4;
        const FONT = 1 << 5;
        const OBJECT = 1 << 6;
        const XMLHTTPREQUEST = 1 << 7;
        const PING = 1 << 8;
        const CSP_REPORT = 1 << 9;
        const MEDIA = 1 << 10;
        const WEBSOCKET = 1 << 11;
        const WEBTRANSPORT = 1 << 12;
        const WEBBUNDLE = 1 << 13;
        const OTHER = 1 << 14;

        /// Every type except top-level navigation
        const NON_NAVIGATION = Self::SUB_FRAME.bits()
            | Self::STYLESHEET.bits()
            | Self::SCRIPT.bits()
            | Self::IMAGE.bits()
            | Self::FONT.bits()
            | Self::OBJECT.bits()
            | Self::XMLHTTPREQUEST.bits()
            | Self::PING.bits()
            | Self::CSP_REPORT.bits()
            | Self::MEDIA.bits()
            | Self::WEBSOCKET.bits()
            | Self::WEBTRANSPORT.bits()
            | Self::WEBBUNDLE.bits()
            | Self::OTHER.bits();
    }
}

const REQUEST_TYPE_NAMES: [(RequestType, &str); 15] = [
    (RequestType::MAIN_FRAME, "main_frame"),
    (RequestType::SUB_FRAME, "sub_frame"),
    (RequestType::STYLESHEET, "stylesheet"),
    (RequestType::SCRIPT, "script"),
    (RequestType::IMAGE, "image"),
    (RequestType::FONT, "font"),
    (RequestType::OBJECT, "object"),
    (RequestType::XMLHTTPREQUEST, "xmlhttprequest"),
    (RequestType::PING, "ping"),
    (RequestType::CSP_REPORT, "csp_report"),
    (RequestType::MEDIA, "media"),
    (RequestType::WEBSOCKET, "websocket"),
    (RequestType::WEBTRANSPORT, "webtransport"),
    (RequestType::WEBBUNDLE, "webbundle"),
    (RequestType::OTHER, "other"),
];

impl RequestType {
    /// Parse from browser resource type string. Unknown names map to
    /// `OTHER`.
    pub fn from_resource_type(s: &str) -> Self {
        REQUEST_TYPE_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(flag, _)| *flag)
            .unwrap_or(Self::OTHER)
    }

    /// Names of every set type, in declaration order.
    pub fn names(&self) -> Vec<&'static str> {
        REQUEST_TYPE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl Serialize for RequestType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RequestType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RequestTypeVisitor;

        impl<'de> Visitor<'de> for RequestTypeVisitor {
            type Value = RequestType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of resource type names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut mask = RequestType::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    mask |= RequestType::from_resource_type(&name);
                }
                Ok(mask)
            }
        }

        deserializer.deserialize_seq(RequestTypeVisitor)
    }
}

// =============================================================================
// Compiled Rules
// =============================================================================

/// Priority tier of a plain block rule.
pub const PRIORITY_BLOCK: u8 = 1;
/// Priority tier of a redirect rule; wins ties against plain blocks.
pub const PRIORITY_REDIRECT: u8 = 2;

/// Action of a compiled rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    /// Cancel the request
    Block,
    /// Send the navigation to a page bundled with the extension
    Redirect { redirect: RedirectTarget },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTarget {
    pub extension_path: String,
}

/// Match condition of a compiled rule. Exactly one filter is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    pub resource_types: RequestType,
}

/// One enforcement primitive handed to the host's filtering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: u32,
    pub priority: u8,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl CompiledRule {
    pub fn is_redirect(&self) -> bool {
        matches!(self.action, RuleAction::Redirect { .. })
    }
}

/// Rule id -> originating entry, as persisted under `ruleIdToEntryKey`.
/// JSON object keys carry the stringified id.
pub type RuleIdMap = BTreeMap<u32, EntryKey>;

// =============================================================================
// Hit Logs
// =============================================================================

/// One row of a log bucket: hits on a single site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub site: String,
    pub sample_url: String,
    pub count: u64,
    pub last_blocked_at: DateTime<Utc>,
}

/// Per-entry hit records, most recent first.
pub type LogBucket = Vec<LogRecord>;

/// All buckets, as persisted under `blockedLogs`.
pub type LogBuckets = BTreeMap<EntryKey, LogBucket>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_key_joins_type_and_value() {
        assert_eq!(Entry::domain("example.com").key().as_str(), "domain:example.com");
        assert_eq!(Entry::pattern("*://a/*").key().as_str(), "pattern:*://a/*");
    }

    #[test]
    fn entry_serializes_camel_case() {
        let mut entry = Entry::domain("example.com");
        entry.requires_master_pin = true;
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "domain",
                "value": "example.com",
                "action": "block",
                "requiresMasterPin": true,
            })
        );
    }

    #[test]
    fn request_types_serialize_as_names() {
        let mask = RequestType::MAIN_FRAME | RequestType::SCRIPT;
        let json = serde_json::to_string(&mask).unwrap();
        assert_eq!(json, r#"["main_frame","script"]"#);
        let back: RequestType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn resource_type_names_parse() {
        assert_eq!(RequestType::from_resource_type("sub_frame"), RequestType::SUB_FRAME);
        assert_eq!(RequestType::from_resource_type("main_frame"), RequestType::MAIN_FRAME);
        assert_eq!(RequestType::from_resource_type("beacon"), RequestType::OTHER);
        let mask: RequestType = serde_json::from_str(r#"["script","nope"]"#).unwrap();
        assert_eq!(mask, RequestType::SCRIPT | RequestType::OTHER);
    }

    #[test]
    fn non_navigation_excludes_main_frame() {
        assert!(!RequestType::NON_NAVIGATION.contains(RequestType::MAIN_FRAME));
        assert_eq!(RequestType::NON_NAVIGATION.names().len(), 14);
    }

    #[test]
    fn redirect_action_shape() {
        let action = RuleAction::Redirect {
            redirect: RedirectTarget { extension_path: "/blocked.html".into() },
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "redirect", "redirect": {"extensionPath": "/blocked.html"}})
        );
        let block = serde_json::to_value(RuleAction::Block).unwrap();
        assert_eq!(block, serde_json::json!({"type": "block"}));
    }

    #[test]
    fn rule_id_map_uses_string_keys() {
        let mut map = RuleIdMap::new();
        map.insert(1000, EntryKey::from("domain:example.com"));
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"1000":"domain:example.com"}"#);
        let back: RuleIdMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
