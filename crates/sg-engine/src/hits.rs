//! Hit logging
//!
//! Rule-matched notifications can arrive back to back, faster than a
//! read-modify-write of `blockedLogs` completes. All of them go through a
//! single writer task fed by an unbounded FIFO channel, so at most one
//! cycle touches the log key at a time and arrival order is preserved.
//! Rebuilds prune buckets through the same queue, so nothing else ever
//! writes `blockedLogs`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sg_core::config::{EngineConfig, KEY_LOGS, KEY_RULE_MAP};
use sg_core::logs::{prune_buckets, record_hit};
use sg_core::types::{EntryKey, LogBuckets, RuleIdMap};
use sg_core::url::site_for_url;

use crate::error::StoreError;
use crate::store::{read_json, write_json, KeyValueStore};

enum HitCommand {
    Record {
        rule_id: u32,
        url: String,
        at: DateTime<Utc>,
    },
    Prune {
        keep: HashSet<EntryKey>,
        done: oneshot::Sender<Result<usize, StoreError>>,
    },
    Flush(oneshot::Sender<()>),
}

/// What happened to one recorded hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitOutcome {
    Recorded,
    /// The rule id was not in the mapping of the last sync.
    Stale,
}

/// Handle to the hit-logging writer task. Cheap to clone.
#[derive(Clone)]
pub struct HitLogger {
    tx: mpsc::UnboundedSender<HitCommand>,
}

impl HitLogger {
    /// Spawn the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, config: &EngineConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_records = config.max_bucket_records;
        let task = tokio::spawn(run_writer(store, max_records, rx));
        (Self { tx }, task)
    }

    /// Queue a hit. Malformed notifications (negative or oversized id, empty
    /// URL) are dropped here without touching storage.
    pub fn record_hit(&self, rule_id: i64, url: &str) {
        let rule_id = match u32::try_from(rule_id) {
            Ok(id) => id,
            Err(_) => return,
        };
        if url.trim().is_empty() {
            return;
        }

        let command = HitCommand::Record {
            rule_id,
            url: url.to_string(),
            at: Utc::now(),
        };
        if self.tx.send(command).is_err() {
            log::warn!("Hit logger stopped; dropping hit for rule {}", rule_id);
        }
    }

    /// Drop every bucket whose key is not in `keep`, after the hits already
    /// queued. Returns how many buckets were dropped.
    pub async fn prune(&self, keep: HashSet<EntryKey>) -> Result<usize, StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(HitCommand::Prune { keep, done: done_tx })
            .map_err(|_| writer_stopped())?;
        done_rx.await.map_err(|_| writer_stopped())?
    }

    /// Wait until every hit queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HitCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(
    store: Arc<dyn KeyValueStore>,
    max_records: usize,
    mut rx: mpsc::UnboundedReceiver<HitCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            HitCommand::Record { rule_id, url, at } => {
                match apply_hit(store.as_ref(), rule_id, &url, at, max_records).await {
                    Ok(HitOutcome::Recorded) => {}
                    Ok(HitOutcome::Stale) => {
                        log::debug!("Ignoring hit for unmapped rule {}", rule_id);
                    }
                    Err(e) => log::error!("Failed to record hit for rule {}: {}", rule_id, e),
                }
            }
            HitCommand::Prune { keep, done } => {
                let _ = done.send(apply_prune(store.as_ref(), &keep).await);
            }
            HitCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn writer_stopped() -> StoreError {
    StoreError::Write {
        key: KEY_LOGS.to_string(),
        reason: "hit logger stopped".to_string(),
    }
}

/// One read-modify-write cycle against the log bucket of `rule_id`'s entry.
pub async fn apply_hit(
    store: &dyn KeyValueStore,
    rule_id: u32,
    url: &str,
    at: DateTime<Utc>,
    max_records: usize,
) -> Result<HitOutcome, StoreError> {
    let rule_map: RuleIdMap = read_json(store, KEY_RULE_MAP).await?;
    let key = match rule_map.get(&rule_id) {
        Some(key) => key.clone(),
        None => return Ok(HitOutcome::Stale),
    };

    let mut logs: LogBuckets = read_json(store, KEY_LOGS).await?;
    let site = site_for_url(url);
    let bucket = logs.entry(key).or_default();
    record_hit(bucket, &site, url, at, max_records);

    write_json(store, KEY_LOGS, &logs).await?;
    Ok(HitOutcome::Recorded)
}

/// Drop buckets of entries outside `keep`. Storage is only written when
/// something was dropped.
pub async fn apply_prune(
    store: &dyn KeyValueStore,
    keep: &HashSet<EntryKey>,
) -> Result<usize, StoreError> {
    let logs: LogBuckets = read_json(store, KEY_LOGS).await?;
    let (logs, dropped) = prune_buckets(logs, keep);
    if dropped > 0 {
        write_json(store, KEY_LOGS, &logs).await?;
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    async fn store_with_mapping() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .set(KEY_RULE_MAP, json!({"1000": "domain:example.com", "1001": "domain:example.com", "1002": "pattern:*ads*"}))
            .await
            .unwrap();
        store
    }

    async fn logs(store: &MemoryStore) -> LogBuckets {
        read_json(store, KEY_LOGS).await.unwrap()
    }

    #[tokio::test]
    async fn repeated_site_counts_up() {
        let store = store_with_mapping().await;
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());

        logger.record_hit(1000, "https://sub.example.com/page");
        logger.flush().await;
        let bucket = logs(&store).await[&EntryKey::from("domain:example.com")].clone();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].site, "sub.example.com");
        assert_eq!(bucket[0].count, 1);

        logger.record_hit(1001, "https://sub.example.com/other");
        logger.flush().await;
        let bucket = logs(&store).await[&EntryKey::from("domain:example.com")].clone();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].count, 2);
        assert_eq!(bucket[0].sample_url, "https://sub.example.com/other");
    }

    #[tokio::test]
    async fn malformed_and_stale_hits_are_ignored() {
        let store = store_with_mapping().await;
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());

        logger.record_hit(-1, "https://a.com/");
        logger.record_hit(i64::from(u32::MAX) + 1, "https://a.com/");
        logger.record_hit(1000, "   ");
        logger.record_hit(4242, "https://a.com/");
        logger.flush().await;

        assert!(logs(&store).await.is_empty());
    }

    #[tokio::test]
    async fn burst_of_hits_is_serialized() {
        let store = store_with_mapping().await;
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());

        for i in 0..30 {
            logger.record_hit(1002, &format!("https://site{}.net/ad.js", i));
        }
        for _ in 0..5 {
            logger.record_hit(1002, "https://site3.net/ad.js");
        }
        logger.flush().await;

        let bucket = logs(&store).await[&EntryKey::from("pattern:*ads*")].clone();
        assert_eq!(bucket.len(), 20);
        assert!(bucket.windows(2).all(|w| w[0].last_blocked_at >= w[1].last_blocked_at));
        assert_eq!(bucket[0].site, "site3.net");
        assert_eq!(bucket[0].count, 5);
        assert!(bucket.iter().all(|r| r.site != "site10.net"));
        assert!(bucket.iter().any(|r| r.site == "site11.net"));
    }

    #[tokio::test]
    async fn unparsable_url_uses_raw_string_as_site() {
        let store = store_with_mapping().await;
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());
        logger.record_hit(1000, "data-blob-42");
        logger.flush().await;
        let bucket = logs(&store).await[&EntryKey::from("domain:example.com")].clone();
        assert_eq!(bucket[0].site, "data-blob-42");
    }

    #[tokio::test]
    async fn prune_waits_for_queued_hits() {
        let store = store_with_mapping().await;
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());

        logger.record_hit(1002, "https://ads.net/x.js");
        logger.record_hit(1000, "https://example.com/");
        let keep: HashSet<EntryKey> = [EntryKey::from("domain:example.com")].into_iter().collect();
        let dropped = logger.prune(keep.clone()).await.unwrap();
        assert_eq!(dropped, 1);

        let logs = logs(&store).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[&EntryKey::from("domain:example.com")][0].count, 1);

        assert_eq!(logger.prune(keep).await.unwrap(), 0);
    }

    /// Fails every other write to the log key.
    struct FlakyStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
            if key == KEY_LOGS && self.writes.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(StoreError::Write {
                    key: key.to_string(),
                    reason: "quota exceeded".into(),
                });
            }
            self.inner.set(key, value).await
        }

        fn subscribe(&self) -> broadcast::Receiver<crate::store::StorageChange> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn failed_write_does_not_block_queue() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
        });
        store
            .inner
            .set(KEY_RULE_MAP, json!({"1000": "domain:example.com"}))
            .await
            .unwrap();
        let (logger, _task) = HitLogger::spawn(store.clone(), &EngineConfig::default());

        logger.record_hit(1000, "https://a.example.com/");
        logger.record_hit(1000, "https://b.example.com/");
        logger.flush().await;

        let logs: LogBuckets = read_json(&store.inner, KEY_LOGS).await.unwrap();
        let bucket = &logs[&EntryKey::from("domain:example.com")];
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].site, "b.example.com");
    }
}
