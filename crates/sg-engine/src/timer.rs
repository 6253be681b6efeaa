//! Durable timer seam
//!
//! Durable timers survive process restarts and are the correctness source of
//! truth for expiry. Each named timer is single-shot.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};

use crate::error::TimerError;

/// Host-provided named timers.
#[async_trait]
pub trait DurableTimers: Send + Sync {
    /// Arm `name` for `at`, replacing any previous instant.
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), TimerError>;

    /// Clear `name`. Returns whether a timer was armed.
    async fn clear(&self, name: &str) -> Result<bool, TimerError>;

    /// Instant `name` is armed for, if any.
    async fn armed(&self, name: &str) -> Result<Option<DateTime<Utc>>, TimerError>;

    /// Subscribe to timer-fired notifications (carrying the timer name).
    fn subscribe_fired(&self) -> broadcast::Receiver<String>;
}

const FIRED_CHANNEL_CAPACITY: usize = 16;

/// In-memory timers. Nothing fires on its own: call [`MemoryTimers::fire_due`]
/// to play the host's role.
pub struct MemoryTimers {
    armed: Mutex<HashMap<String, DateTime<Utc>>>,
    fired: broadcast::Sender<String>,
}

impl MemoryTimers {
    pub fn new() -> Self {
        let (fired, _) = broadcast::channel(FIRED_CHANNEL_CAPACITY);
        Self {
            armed: Mutex::new(HashMap::new()),
            fired,
        }
    }

    /// Fire every timer due at `now`. Returns the names fired.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = {
            let mut armed = self.armed.lock().await;
            let names: Vec<String> = armed
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                armed.remove(name);
            }
            names
        };

        for name in &due {
            log::debug!("Timer '{}' fired", name);
            let _ = self.fired.send(name.clone());
        }
        due
    }
}

impl Default for MemoryTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableTimers for MemoryTimers {
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), TimerError> {
        self.armed.lock().await.insert(name.to_string(), at);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool, TimerError> {
        Ok(self.armed.lock().await.remove(name).is_some())
    }

    async fn armed(&self, name: &str) -> Result<Option<DateTime<Utc>>, TimerError> {
        Ok(self.armed.lock().await.get(name).copied())
    }

    fn subscribe_fired(&self) -> broadcast::Receiver<String> {
        self.fired.subscribe()
    }
}
