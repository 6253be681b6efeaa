//! Engine facade and event loop
//!
//! The engine owns the collaborators and the one piece of process state the
//! lifecycle needs: the trigger channel. Everything that can cause work
//! (startup, resume, storage changes, timers, rule matches) is funneled into
//! that channel and dispatched by a single loop started with
//! [`Engine::start`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use sg_compiler::normalizer::normalize_entry;
use sg_compiler::{normalize, upsert_entry, UpsertOutcome};
use sg_core::config::{EngineConfig, KEY_ENTRIES, KEY_LOGS};
use sg_core::types::{Entry, EntryKey, LogBuckets};

use crate::enforcement::{EnforcementLayer, RuleMatch};
use crate::error::EngineError;
use crate::hits::HitLogger;
use crate::scheduler::ExpiryScheduler;
use crate::store::{read_json, write_json, KeyValueStore, StorageArea, StorageChange};
use crate::sync::{SyncOrchestrator, SyncReport};
use crate::timer::DurableTimers;

/// Something that may require the engine to act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    /// The host woke the process up again (service worker restart, resume
    /// from suspend).
    Resume,
    StorageChanged(StorageChange),
    TimerFired(String),
    RuleMatched(RuleMatch),
}

const REPORT_CHANNEL_CAPACITY: usize = 16;

pub struct Engine {
    store: Arc<dyn KeyValueStore>,
    enforcement: Arc<dyn EnforcementLayer>,
    timers: Arc<dyn DurableTimers>,
    sync: Arc<SyncOrchestrator>,
    hits: HitLogger,
    triggers: mpsc::UnboundedSender<Trigger>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
    reports: broadcast::Sender<SyncReport>,
    entries_lock: Mutex<()>,
    config: EngineConfig,
}

impl Engine {
    /// Wire the engine to its collaborators. Must be called inside a tokio
    /// runtime; the hit-logging writer task is spawned here.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        enforcement: Arc<dyn EnforcementLayer>,
        timers: Arc<dyn DurableTimers>,
        config: EngineConfig,
    ) -> Self {
        let (triggers, inbox) = mpsc::unbounded_channel();
        let (hits, _writer) = HitLogger::spawn(store.clone(), &config);
        let scheduler = Arc::new(ExpiryScheduler::new(
            timers.clone(),
            &config.expiry_timer,
            Some(triggers.clone()),
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            store.clone(),
            enforcement.clone(),
            scheduler,
            hits.clone(),
            config.clone(),
        ));
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        Self {
            store,
            enforcement,
            timers,
            sync,
            hits,
            triggers,
            inbox: Mutex::new(Some(inbox)),
            reports,
            entries_lock: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the event loop and queue the startup trigger. Returns `None` if
    /// the engine was already started.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        let mut inbox = match self.inbox.lock().await.take() {
            Some(inbox) => inbox,
            None => {
                log::warn!("Engine already started");
                return None;
            }
        };

        forward(self.store.subscribe(), self.triggers.clone(), Trigger::StorageChanged);
        forward(self.timers.subscribe_fired(), self.triggers.clone(), Trigger::TimerFired);
        forward(
            self.enforcement.subscribe_matches(),
            self.triggers.clone(),
            Trigger::RuleMatched,
        );
        self.trigger(Trigger::Startup);

        let sync = self.sync.clone();
        let hits = self.hits.clone();
        let reports = self.reports.clone();
        let timer_name = self.config.expiry_timer.clone();

        let handle = tokio::spawn(async move {
            while let Some(trigger) = inbox.recv().await {
                let rebuild = match &trigger {
                    Trigger::Startup | Trigger::Resume => true,
                    Trigger::StorageChanged(change) => {
                        change.key == KEY_ENTRIES && change.area == StorageArea::Local
                    }
                    Trigger::TimerFired(name) => {
                        if *name != timer_name {
                            log::debug!("Ignoring unknown timer '{}'", name);
                        }
                        *name == timer_name
                    }
                    Trigger::RuleMatched(hit) => {
                        hits.record_hit(hit.rule_id, &hit.url);
                        false
                    }
                };
                if rebuild {
                    spawn_rebuild(&sync, &reports, trigger);
                }
            }
        });
        Some(handle)
    }

    /// Queue a trigger for the event loop.
    pub fn trigger(&self, trigger: Trigger) {
        if self.triggers.send(trigger).is_err() {
            log::warn!("Engine loop stopped; trigger dropped");
        }
    }

    /// Rebuild immediately, bypassing the loop.
    pub async fn rebuild(&self) -> Result<SyncReport, EngineError> {
        let report = self.sync.rebuild().await?;
        let _ = self.reports.send(report.clone());
        Ok(report)
    }

    /// Subscribe to the reports of every rebuild that completes.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    pub fn record_hit(&self, rule_id: i64, url: &str) {
        self.hits.record_hit(rule_id, url);
    }

    /// Record a raw host notification. Payloads that do not carry a rule id
    /// and URL are dropped.
    pub fn record_notification(&self, payload: &Value) {
        match RuleMatch::from_json(payload) {
            Some(hit) => self.hits.record_hit(hit.rule_id, &hit.url),
            None => log::debug!("Dropping malformed rule match: {}", payload),
        }
    }

    /// Wait for every hit queued so far to be written.
    pub async fn flush_hits(&self) {
        self.hits.flush().await;
    }

    /// Current normalized entries, expired ones included until the next
    /// rebuild drops them.
    pub async fn entries(&self) -> Result<Vec<Entry>, EngineError> {
        let raw: Value = self
            .store
            .get(KEY_ENTRIES)
            .await?
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(normalize(&raw, &self.config))
    }

    /// Add an entry, merging it with an existing entry of the same key. The
    /// resulting write to `blockedEntries` triggers the rebuild.
    pub async fn add_entry(&self, raw: &Value) -> Result<UpsertOutcome, EngineError> {
        let incoming = normalize_entry(raw, &self.config)
            .ok_or_else(|| EngineError::InvalidEntry(raw.to_string()))?;

        let _guard = self.entries_lock.lock().await;
        let mut entries = self.entries().await?;
        let key = incoming.key();
        let outcome = upsert_entry(&mut entries, incoming);
        write_json(self.store.as_ref(), KEY_ENTRIES, &entries).await?;
        log::debug!("Entry {} {:?}", key, outcome);
        Ok(outcome)
    }

    /// Remove an entry. Protected entries need `pin_verified`.
    pub async fn remove_entry(
        &self,
        key: &EntryKey,
        pin_verified: bool,
    ) -> Result<Entry, EngineError> {
        let _guard = self.entries_lock.lock().await;
        let mut entries = self.entries().await?;
        let removed = sg_compiler::remove_entry(&mut entries, key, pin_verified)?;
        write_json(self.store.as_ref(), KEY_ENTRIES, &entries).await?;
        log::debug!("Entry {} removed", key);
        Ok(removed)
    }

    /// Active hide-elements entries for the element-suppression collaborator.
    pub async fn hide_element_entries(&self) -> Result<Vec<Entry>, EngineError> {
        let entries = self.entries().await?;
        Ok(sg_compiler::hide_element_entries(&entries, Utc::now())
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn logs(&self) -> Result<LogBuckets, EngineError> {
        Ok(read_json(self.store.as_ref(), KEY_LOGS).await?)
    }
}

fn spawn_rebuild(
    sync: &Arc<SyncOrchestrator>,
    reports: &broadcast::Sender<SyncReport>,
    cause: Trigger,
) {
    let sync = sync.clone();
    let reports = reports.clone();
    tokio::spawn(async move {
        log::debug!("Rebuilding after {:?}", cause);
        match sync.rebuild().await {
            Ok(report) => {
                let _ = reports.send(report);
            }
            Err(e) => log::error!("Rebuild failed: {}", e),
        }
    });
}

/// Pump a collaborator's notifications into the trigger channel. A lagged
/// subscription may have missed an entries change, so it resynchronizes.
fn forward<T, F>(
    mut rx: broadcast::Receiver<T>,
    triggers: mpsc::UnboundedSender<Trigger>,
    wrap: F,
) where
    T: Clone + Send + 'static,
    F: Fn(T) -> Trigger + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let trigger = match rx.recv().await {
                Ok(item) => wrap(item),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} notifications; resynchronizing", missed);
                    Trigger::Resume
                }
                Err(RecvError::Closed) => break,
            };
            if triggers.send(trigger).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::MemoryEnforcement;
    use crate::store::MemoryStore;
    use crate::timer::MemoryTimers;
    use serde_json::json;
    use sg_compiler::RemoveError;
    use std::time::Duration;

    fn engine() -> (Engine, Arc<MemoryStore>, Arc<MemoryEnforcement>) {
        let store = Arc::new(MemoryStore::new());
        let enforcement = Arc::new(MemoryEnforcement::new());
        let engine = Engine::new(
            store.clone(),
            enforcement.clone(),
            Arc::new(MemoryTimers::new()),
            EngineConfig::default(),
        );
        (engine, store, enforcement)
    }

    #[tokio::test]
    async fn add_entry_merges_longest_duration() {
        let (engine, _, _) = engine();
        let outcome = engine
            .add_entry(&json!({"type": "domain", "value": "example.com", "expiresAt": "2030-01-01T00:00:00Z"}))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let outcome = engine
            .add_entry(&json!({"type": "domain", "value": "www.example.com", "expiresAt": "2029-01-01T00:00:00Z"}))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Merged);

        let entries = engine.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].expires_at.map(|t| t.to_rfc3339()),
            Some("2030-01-01T00:00:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn add_entry_rejects_invalid_host() {
        let (engine, _, _) = engine();
        let err = engine
            .add_entry(&json!({"type": "domain", "value": "not a host"}))
            .await;
        assert!(matches!(err, Err(EngineError::InvalidEntry(_))));
    }

    #[tokio::test]
    async fn protected_entry_needs_pin() {
        let (engine, _, _) = engine();
        engine
            .add_entry(&json!({"type": "pattern", "value": "*://*/ads/*", "requiresMasterPin": "yes"}))
            .await
            .unwrap();
        let key = EntryKey::from("pattern:*://*/ads/*");

        let err = engine.remove_entry(&key, false).await;
        assert!(matches!(err, Err(EngineError::Remove(RemoveError::Protected(_)))));
        assert!(engine.remove_entry(&key, true).await.is_ok());
        assert!(engine.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_change_triggers_rebuild() {
        let (engine, _, enforcement) = engine();
        let mut reports = engine.subscribe_reports();
        let _loop = engine.start().await.unwrap();
        assert!(engine.start().await.is_none());

        let startup = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(startup.rules_installed, 0);

        engine
            .add_entry(&json!({"type": "domain", "value": "example.com"}))
            .await
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.rules_installed, 2);
        assert_eq!(enforcement.rules().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notifications_reach_the_hit_log() {
        let (engine, _, _) = engine();
        engine
            .add_entry(&json!({"type": "domain", "value": "example.com"}))
            .await
            .unwrap();
        engine.rebuild().await.unwrap();

        engine.record_notification(&json!({"rule": {"ruleId": 1000}, "request": {"url": "https://example.com/a"}}));
        engine.record_notification(&json!({"ruleId": "oops"}));
        engine.flush_hits().await;

        let logs = engine.logs().await.unwrap();
        assert_eq!(logs[&EntryKey::from("domain:example.com")][0].count, 1);
    }

    #[tokio::test]
    async fn hide_elements_view_lists_selectors() {
        let (engine, _, _) = engine();
        engine
            .add_entry(&json!({"value": "news.com", "action": "hide-elements", "selectors": [" .banner ", ".banner", "#promo"]}))
            .await
            .unwrap();
        engine
            .add_entry(&json!({"value": "other.com"}))
            .await
            .unwrap();

        let hidden = engine.hide_element_entries().await.unwrap();
        assert_eq!(hidden.len(), 1);
        assert_eq!(
            hidden[0].selectors.as_deref(),
            Some(&[".banner".to_string(), "#promo".to_string()][..])
        );
    }
}
