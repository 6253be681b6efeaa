//! Full rebuild of the enforcement state
//!
//! A rebuild reads one snapshot of the stored entries and derives everything
//! else from it: the installed rule set, the id -> key mapping, the pruned
//! log buckets and the next expiry. The installed rules are always replaced
//! wholesale, never diffed. Log pruning is handed to the hit logger so it
//! queues behind hits already in flight.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use sg_compiler::{compile, normalize_with_stats};
use sg_core::config::{EngineConfig, KEY_ENTRIES, KEY_RULE_MAP};
use sg_core::expiry::is_active;
use sg_core::types::{Entry, EntryKey};

use crate::enforcement::EnforcementLayer;
use crate::error::EngineError;
use crate::hits::HitLogger;
use crate::scheduler::ExpiryScheduler;
use crate::store::{write_json, KeyValueStore};

/// Outcome of one rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub active_entries: usize,
    pub expired_entries: usize,
    pub rules_installed: usize,
    pub rules_removed: usize,
    pub buckets_pruned: usize,
    pub truncated: bool,
    pub next_expiry: Option<DateTime<Utc>>,
}

pub struct SyncOrchestrator {
    store: Arc<dyn KeyValueStore>,
    enforcement: Arc<dyn EnforcementLayer>,
    scheduler: Arc<ExpiryScheduler>,
    hits: HitLogger,
    config: EngineConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        enforcement: Arc<dyn EnforcementLayer>,
        scheduler: Arc<ExpiryScheduler>,
        hits: HitLogger,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            enforcement,
            scheduler,
            hits,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn rebuild(&self) -> Result<SyncReport, EngineError> {
        self.rebuild_at(Utc::now()).await
    }

    /// Rebuild as of `now`. Safe to call repeatedly or concurrently; the last
    /// rebuild to finish owns the stored mapping.
    pub async fn rebuild_at(&self, now: DateTime<Utc>) -> Result<SyncReport, EngineError> {
        let store = self.store.as_ref();

        let raw = store
            .get(KEY_ENTRIES)
            .await?
            .unwrap_or_else(|| Value::Array(Vec::new()));

        let (entries, _) = normalize_with_stats(&raw, &self.config);
        let (active, expired): (Vec<Entry>, Vec<Entry>) =
            entries.into_iter().partition(|e| is_active(e, now));

        let compilation = compile(&active, &self.config);

        let existing_ids: Vec<u32> = self
            .enforcement
            .rules()
            .await?
            .iter()
            .map(|rule| rule.id)
            .collect();
        let rules_removed = existing_ids.len();
        let rules_installed = compilation.rules.len();
        self.enforcement
            .replace_rules(existing_ids, compilation.rules)
            .await?;

        write_json(store, KEY_RULE_MAP, &compilation.rule_map).await?;

        let active_keys: HashSet<EntryKey> = active.iter().map(Entry::key).collect();
        let buckets_pruned = self.hits.prune(active_keys).await?;

        if !expired.is_empty() {
            for entry in &expired {
                log::debug!("Entry {} expired", entry.key());
            }
            write_json(store, KEY_ENTRIES, &active).await?;
        }

        let next_expiry = match self.scheduler.schedule_at(&active, now).await {
            Ok(next) => next,
            Err(e) => {
                log::error!("Failed to schedule expiry: {}", e);
                None
            }
        };

        let report = SyncReport {
            active_entries: active.len(),
            expired_entries: expired.len(),
            rules_installed,
            rules_removed,
            buckets_pruned,
            truncated: compilation.truncated,
            next_expiry,
        };
        log::debug!(
            "Sync complete: {} active, {} expired, {} rules installed, {} buckets pruned",
            report.active_entries,
            report.expired_entries,
            report.rules_installed,
            report.buckets_pruned
        );
        Ok(report)
    }
}
