//! Enforcement layer seam
//!
//! The host's network-filtering layer is stateless between syncs from the
//! engine's point of view: it is only ever told "remove these ids, add these
//! rules" in one atomic call, and it reports rule matches back.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use sg_core::types::{CompiledRule, RequestType, RuleCondition};
use sg_core::url::extract_host;

use crate::error::EnforcementError;

/// A rule-matched notification, as emitted by the host.
///
/// The id is kept signed so that malformed host payloads can be rejected by
/// the hit logger rather than at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: i64,
    pub url: String,
}

impl RuleMatch {
    /// Parse a host payload. Accepts the flat `{ruleId, url}` shape (or
    /// `matchedUrl`) and the nested `{rule: {ruleId}, request: {url}}` debug
    /// shape. Returns `None` for anything without an integral id and a
    /// string URL.
    pub fn from_json(payload: &Value) -> Option<Self> {
        let rule_id = payload
            .get("ruleId")
            .or_else(|| payload.get("rule").and_then(|r| r.get("ruleId")))
            .and_then(as_integer)?;
        let url = payload
            .get("url")
            .or_else(|| payload.get("matchedUrl"))
            .or_else(|| payload.get("request").and_then(|r| r.get("url")))
            .and_then(Value::as_str)?;
        Some(Self {
            rule_id,
            url: url.to_string(),
        })
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Host-provided rule enforcement.
#[async_trait]
pub trait EnforcementLayer: Send + Sync {
    /// Currently installed rules.
    async fn rules(&self) -> Result<Vec<CompiledRule>, EnforcementError>;

    /// Atomically remove `remove_ids` and add `add`. Either the whole update
    /// applies or none of it does.
    async fn replace_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<CompiledRule>,
    ) -> Result<(), EnforcementError>;

    /// Subscribe to rule-matched notifications.
    fn subscribe_matches(&self) -> broadcast::Receiver<RuleMatch>;
}

const MATCH_CHANNEL_CAPACITY: usize = 256;

/// In-memory dynamic rule set that can evaluate requests.
pub struct MemoryEnforcement {
    rules: Mutex<Vec<CompiledRule>>,
    matches: broadcast::Sender<RuleMatch>,
}

impl MemoryEnforcement {
    pub fn new() -> Self {
        let (matches, _) = broadcast::channel(MATCH_CHANNEL_CAPACITY);
        Self {
            rules: Mutex::new(Vec::new()),
            matches,
        }
    }

    /// Evaluate a request the way the host would: among matching rules the
    /// highest priority wins, then the lowest id. A match is broadcast to
    /// subscribers.
    pub async fn evaluate(&self, url: &str, resource_type: RequestType) -> Option<CompiledRule> {
        let winner = {
            let rules = self.rules.lock().await;
            rules
                .iter()
                .filter(|rule| rule.condition.resource_types.intersects(resource_type))
                .filter(|rule| condition_matches(&rule.condition, url))
                .min_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)))
                .cloned()
        }?;

        let _ = self.matches.send(RuleMatch {
            rule_id: i64::from(winner.id),
            url: url.to_string(),
        });
        Some(winner)
    }
}

impl Default for MemoryEnforcement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnforcementLayer for MemoryEnforcement {
    async fn rules(&self) -> Result<Vec<CompiledRule>, EnforcementError> {
        Ok(self.rules.lock().await.clone())
    }

    async fn replace_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<CompiledRule>,
    ) -> Result<(), EnforcementError> {
        let mut rules = self.rules.lock().await;
        let remove: HashSet<u32> = remove_ids.into_iter().collect();
        let mut next: Vec<CompiledRule> = rules
            .iter()
            .filter(|rule| !remove.contains(&rule.id))
            .cloned()
            .collect();

        let mut ids: HashSet<u32> = next.iter().map(|rule| rule.id).collect();
        for rule in &add {
            if !ids.insert(rule.id) {
                return Err(EnforcementError::DuplicateId(rule.id));
            }
        }

        next.extend(add);
        *rules = next;
        Ok(())
    }

    fn subscribe_matches(&self) -> broadcast::Receiver<RuleMatch> {
        self.matches.subscribe()
    }
}

/// Does `url` satisfy a rule condition's filter?
pub fn condition_matches(condition: &RuleCondition, url: &str) -> bool {
    if let Some(filter) = &condition.url_filter {
        return url_filter_matches(filter, url);
    }
    if let Some(expr) = &condition.regex_filter {
        return match RegexBuilder::new(expr).case_insensitive(true).build() {
            Ok(re) => re.is_match(url),
            Err(e) => {
                log::warn!("Skipping rule with invalid regex '{}': {}", expr, e);
                false
            }
        };
    }
    false
}

/// `||host^` matches the host itself or any subdomain of it.
fn url_filter_matches(filter: &str, url: &str) -> bool {
    let target = match filter.strip_prefix("||").and_then(|f| f.strip_suffix('^')) {
        Some(target) => target,
        None => return url.to_ascii_lowercase().contains(&filter.to_ascii_lowercase()),
    };
    let host = match extract_host(url) {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };
    host == target
        || (host.len() > target.len()
            && host.ends_with(target)
            && host.as_bytes()[host.len() - target.len() - 1] == b'.')
}
