//! Engine configuration and storage keys

use serde::{Deserialize, Serialize};

/// Storage key holding the ordered entry list.
pub const KEY_ENTRIES: &str = "blockedEntries";
/// Storage key holding per-entry hit buckets.
pub const KEY_LOGS: &str = "blockedLogs";
/// Storage key holding the rule id -> entry key mapping of the last sync.
pub const KEY_RULE_MAP: &str = "ruleIdToEntryKey";
/// Storage key owned by the PIN collaborator; never written here.
pub const KEY_MASTER_PIN_HASH: &str = "masterPinHash";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables of the compiler and lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// First rule id handed out by a sync
    pub rule_id_base: u32,
    /// Ceiling on emitted enforcement rules
    pub max_rules: usize,
    /// Ceiling on canonical entries
    pub max_entries: usize,
    /// Records kept per log bucket
    pub max_bucket_records: usize,
    /// Selectors kept per hide-elements entry
    pub max_selectors: usize,
    /// Extension page top-level navigations are redirected to
    pub redirect_path: String,
    /// Name of the durable expiry timer
    pub expiry_timer: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_id_base: 1000,
            max_rules: 5000,
            max_entries: 5000,
            max_bucket_records: 20,
            max_selectors: 30,
            redirect_path: "/blocked.html".to_string(),
            expiry_timer: "expiry".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bucket_records == 0 {
            return Err(ConfigError::Invalid("maxBucketRecords must be positive".into()));
        }
        if !self.redirect_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "redirectPath must start with '/': {}",
                self.redirect_path
            )));
        }
        if self.expiry_timer.trim().is_empty() {
            return Err(ConfigError::Invalid("expiryTimer must not be empty".into()));
        }
        let last_id = u64::from(self.rule_id_base) + self.max_rules as u64;
        if last_id > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "ruleIdBase + maxRules overflows rule ids: {}",
                last_id
            )));
        }
        Ok(())
    }
}
