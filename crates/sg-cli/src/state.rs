//! File-backed collaborators
//!
//! The CLI plays the host: storage, the installed rule set and armed alarms
//! each live in one JSON file under the state directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};

use sg_core::types::{CompiledRule, RequestType};
use sg_engine::{
    DurableTimers, EnforcementError, EnforcementLayer, KeyValueStore, MemoryEnforcement,
    RuleMatch, StorageArea, StorageChange, StoreError, TimerError,
};

pub const STORAGE_FILE: &str = "storage.json";
pub const RULES_FILE: &str = "rules.json";
pub const ALARMS_FILE: &str = "alarms.json";

const CHANNEL_CAPACITY: usize = 16;

async fn load_json<T>(path: &Path) -> Result<T, String>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read_to_string(path).await {
        Ok(text) if text.trim().is_empty() => Ok(T::default()),
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| format!("Failed to parse '{}': {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(format!("Failed to read '{}': {}", path.display(), e)),
    }
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize '{}': {}", path.display(), e))?;
    tokio::fs::write(path, text)
        .await
        .map_err(|e| format!("Failed to write '{}': {}", path.display(), e))
}

// =============================================================================
// Storage
// =============================================================================

pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileStore {
    pub async fn open(dir: &Path) -> Result<Self, String> {
        let path = dir.join(STORAGE_FILE);
        let values: Map<String, Value> = load_json(&path).await?;
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        save_json(&self.path, &next)
            .await
            .map_err(|reason| StoreError::Write {
                key: key.to_string(),
                reason,
            })?;
        *values = next;

        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            area: StorageArea::Local,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// Enforcement
// =============================================================================

/// Rule set persisted to `rules.json`, evaluated in memory.
pub struct FileEnforcement {
    path: PathBuf,
    inner: MemoryEnforcement,
}

impl FileEnforcement {
    pub async fn open(dir: &Path) -> Result<Self, String> {
        let path = dir.join(RULES_FILE);
        let rules: Vec<CompiledRule> = load_json(&path).await?;
        let inner = MemoryEnforcement::new();
        inner
            .replace_rules(Vec::new(), rules)
            .await
            .map_err(|e| format!("Invalid rule set in '{}': {}", path.display(), e))?;
        Ok(Self { path, inner })
    }

    pub async fn evaluate(&self, url: &str, resource_type: RequestType) -> Option<CompiledRule> {
        self.inner.evaluate(url, resource_type).await
    }
}

#[async_trait]
impl EnforcementLayer for FileEnforcement {
    async fn rules(&self) -> Result<Vec<CompiledRule>, EnforcementError> {
        self.inner.rules().await
    }

    async fn replace_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<CompiledRule>,
    ) -> Result<(), EnforcementError> {
        self.inner.replace_rules(remove_ids, add).await?;
        let rules = self.inner.rules().await?;
        save_json(&self.path, &rules)
            .await
            .map_err(EnforcementError::Rejected)
    }

    fn subscribe_matches(&self) -> broadcast::Receiver<RuleMatch> {
        self.inner.subscribe_matches()
    }
}

// =============================================================================
// Alarms
// =============================================================================

pub struct FileTimers {
    path: PathBuf,
    armed: Mutex<BTreeMap<String, DateTime<Utc>>>,
    fired: broadcast::Sender<String>,
}

impl FileTimers {
    pub async fn open(dir: &Path) -> Result<Self, String> {
        let path = dir.join(ALARMS_FILE);
        let armed: BTreeMap<String, DateTime<Utc>> = load_json(&path).await?;
        let (fired, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            path,
            armed: Mutex::new(armed),
            fired,
        })
    }

    pub async fn all(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.armed.lock().await.clone()
    }

    async fn update<F>(&self, name: &str, change: F) -> Result<bool, String>
    where
        F: FnOnce(&mut BTreeMap<String, DateTime<Utc>>) -> bool,
    {
        let mut armed = self.armed.lock().await;
        let mut next = armed.clone();
        let changed = change(&mut next);
        save_json(&self.path, &next)
            .await
            .map_err(|e| format!("{} ({})", e, name))?;
        *armed = next;
        Ok(changed)
    }
}

#[async_trait]
impl DurableTimers for FileTimers {
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), TimerError> {
        self.update(name, |armed| armed.insert(name.to_string(), at).is_none())
            .await
            .map(|_| ())
            .map_err(|reason| TimerError::Arm {
                name: name.to_string(),
                reason,
            })
    }

    async fn clear(&self, name: &str) -> Result<bool, TimerError> {
        self.update(name, |armed| armed.remove(name).is_some())
            .await
            .map_err(|reason| TimerError::Clear {
                name: name.to_string(),
                reason,
            })
    }

    async fn armed(&self, name: &str) -> Result<Option<DateTime<Utc>>, TimerError> {
        Ok(self.armed.lock().await.get(name).copied())
    }

    fn subscribe_fired(&self) -> broadcast::Receiver<String> {
        self.fired.subscribe()
    }
}
