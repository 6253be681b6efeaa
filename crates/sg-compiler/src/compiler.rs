//! Rule compilation
//!
//! Maps canonical entries to enforcement rules. Every block entry becomes a
//! redirect rule for top-level navigations followed by a block rule for
//! every other resource type; both share one condition. Ids are handed out
//! sequentially from the configured base, so they depend on entry order.

use sg_core::config::EngineConfig;
use sg_core::types::{
    CompiledRule, Entry, EntryType, RedirectTarget, RequestType, RuleAction, RuleCondition,
    RuleIdMap, PRIORITY_BLOCK, PRIORITY_REDIRECT,
};

use crate::pattern::translate;

/// Output of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compilation {
    pub rules: Vec<CompiledRule>,
    pub rule_map: RuleIdMap,
    /// Set when the rule ceiling cut the output short.
    pub truncated: bool,
}

/// Compile canonical entries into enforcement rules.
///
/// Hide-elements entries produce no rules. Emission stops at
/// `config.max_rules`, possibly between the two rules of one entry.
pub fn compile(entries: &[Entry], config: &EngineConfig) -> Compilation {
    let mut out = Compilation::default();

    'entries: for entry in entries.iter().filter(|e| !e.is_hide_elements()) {
        let key = entry.key();

        let redirect = RuleAction::Redirect {
            redirect: RedirectTarget {
                extension_path: config.redirect_path.clone(),
            },
        };
        let plan = [
            (PRIORITY_REDIRECT, redirect, RequestType::MAIN_FRAME),
            (PRIORITY_BLOCK, RuleAction::Block, RequestType::NON_NAVIGATION),
        ];

        for (priority, action, resource_types) in plan {
            if out.rules.len() >= config.max_rules {
                out.truncated = true;
                break 'entries;
            }

            let id = config.rule_id_base + out.rules.len() as u32;
            out.rules.push(CompiledRule {
                id,
                priority,
                action,
                condition: rule_condition(entry, resource_types),
            });
            out.rule_map.insert(id, key.clone());
        }
    }

    if out.truncated {
        log::warn!(
            "Rule ceiling of {} reached; later entries are not enforced",
            config.max_rules
        );
    }

    out
}

/// Condition shared by both rules of an entry.
pub fn rule_condition(entry: &Entry, resource_types: RequestType) -> RuleCondition {
    match entry.kind {
        EntryType::Domain => RuleCondition {
            url_filter: Some(domain_url_filter(&entry.value)),
            regex_filter: None,
            resource_types,
        },
        EntryType::Pattern => RuleCondition {
            url_filter: None,
            regex_filter: Some(translate(&entry.value)),
            resource_types,
        },
    }
}

/// `||host^`: the host and any subdomain, over any scheme.
pub fn domain_url_filter(host: &str) -> String {
    format!("||{}^", host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::types::{EntryAction, EntryKey};

    fn hide(host: &str) -> Entry {
        let mut entry = Entry::domain(host);
        entry.action = EntryAction::HideElements;
        entry.selectors = Some(vec![".ad".into()]);
        entry
    }

    #[test]
    fn domain_entry_compiles_to_redirect_then_block() {
        let config = EngineConfig::default();
        let out = compile(&[Entry::domain("example.com")], &config);

        assert_eq!(out.rules.len(), 2);
        let redirect = &out.rules[0];
        assert_eq!(redirect.id, 1000);
        assert_eq!(redirect.priority, PRIORITY_REDIRECT);
        assert!(redirect.is_redirect());
        assert_eq!(redirect.condition.resource_types, RequestType::MAIN_FRAME);
        assert_eq!(redirect.condition.url_filter.as_deref(), Some("||example.com^"));

        let block = &out.rules[1];
        assert_eq!(block.id, 1001);
        assert_eq!(block.priority, PRIORITY_BLOCK);
        assert_eq!(block.action, RuleAction::Block);
        assert_eq!(block.condition.resource_types, RequestType::NON_NAVIGATION);
        assert_eq!(block.condition, RuleCondition {
            resource_types: RequestType::NON_NAVIGATION,
            ..redirect.condition.clone()
        });

        let key = EntryKey::from("domain:example.com");
        assert_eq!(out.rule_map.get(&1000), Some(&key));
        assert_eq!(out.rule_map.get(&1001), Some(&key));
        assert!(!out.truncated);
    }

    #[test]
    fn pattern_entry_uses_regex_filter() {
        let out = compile(&[Entry::pattern("*://*.ads.net/*")], &EngineConfig::default());
        assert_eq!(out.rules[0].condition.url_filter, None);
        assert_eq!(
            out.rules[0].condition.regex_filter.as_deref(),
            Some(r"^.*://.*\.ads\.net(?::\d+)?/.*$")
        );
    }

    #[test]
    fn compiles_two_rules_per_block_entry_and_none_for_hide() {
        let entries = vec![
            Entry::domain("a.com"),
            hide("b.com"),
            Entry::pattern("*tracker*"),
            Entry::domain("c.com"),
        ];
        let out = compile(&entries, &EngineConfig::default());
        assert_eq!(out.rules.len(), 6);
        let ids: Vec<u32> = out.rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1000..1006).collect::<Vec<_>>());
        assert!(out.rule_map.values().all(|k| k.as_str() != "domain:b.com"));
        assert_eq!(out.rule_map.get(&1004).map(EntryKey::as_str), Some("domain:c.com"));
    }

    #[test]
    fn ids_follow_input_order() {
        let config = EngineConfig::default();
        let forward = compile(&[Entry::domain("a.com"), Entry::domain("b.com")], &config);
        let reverse = compile(&[Entry::domain("b.com"), Entry::domain("a.com")], &config);
        assert_eq!(forward.rule_map.get(&1000).map(EntryKey::as_str), Some("domain:a.com"));
        assert_eq!(reverse.rule_map.get(&1000).map(EntryKey::as_str), Some("domain:b.com"));
    }

    #[test]
    fn ceiling_can_split_an_entry() {
        let config = EngineConfig {
            max_rules: 3,
            ..EngineConfig::default()
        };
        let out = compile(&[Entry::domain("a.com"), Entry::domain("b.com")], &config);
        assert_eq!(out.rules.len(), 3);
        assert!(out.truncated);
        assert!(out.rules[2].is_redirect());
        assert_eq!(out.rule_map.get(&1002).map(EntryKey::as_str), Some("domain:b.com"));
    }

    #[test]
    fn rules_serialize_in_host_shape() {
        let out = compile(&[Entry::domain("example.com")], &EngineConfig::default());
        let json = serde_json::to_value(&out.rules[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 1000,
                "priority": 2,
                "action": {"type": "redirect", "redirect": {"extensionPath": "/blocked.html"}},
                "condition": {"urlFilter": "||example.com^", "resourceTypes": ["main_frame"]},
            })
        );
    }
}
