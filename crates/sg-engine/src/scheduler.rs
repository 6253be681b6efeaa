//! Expiry scheduling
//!
//! After every sync the scheduler arms one durable timer and one in-process
//! timer for the earliest expiry among active entries. The durable timer is
//! what guarantees the rebuild; the in-process one only shortens latency
//! while the process happens to be alive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use sg_core::expiry::{clamp_delay, next_expiry};
use sg_core::types::Entry;

use crate::engine::Trigger;
use crate::error::TimerError;
use crate::timer::DurableTimers;

pub struct ExpiryScheduler {
    timers: Arc<dyn DurableTimers>,
    timer_name: String,
    triggers: Option<mpsc::UnboundedSender<Trigger>>,
    local: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    /// Scheduler whose in-process timer reports to `triggers`. Without a
    /// trigger channel only the durable timer is armed.
    pub fn new(
        timers: Arc<dyn DurableTimers>,
        timer_name: &str,
        triggers: Option<mpsc::UnboundedSender<Trigger>>,
    ) -> Self {
        Self {
            timers,
            timer_name: timer_name.to_string(),
            triggers,
            local: Mutex::new(None),
        }
    }

    pub fn timer_name(&self) -> &str {
        &self.timer_name
    }

    pub async fn schedule(&self, active: &[Entry]) -> Result<Option<DateTime<Utc>>, TimerError> {
        self.schedule_at(active, Utc::now()).await
    }

    /// Arm timers for the earliest expiry in `active`, or clear them when
    /// nothing expires. Returns the instant armed for.
    pub async fn schedule_at(
        &self,
        active: &[Entry],
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TimerError> {
        let next = match next_expiry(active) {
            Some(at) => at,
            None => {
                self.cancel_local().await;
                self.timers.clear(&self.timer_name).await?;
                log::debug!("No expiring entries; timer '{}' cleared", self.timer_name);
                return Ok(None);
            }
        };

        // Arm the in-process timer first so a durable failure still leaves
        // a wake-up behind.
        self.arm_local(next, now).await;
        self.timers.arm(&self.timer_name, next).await?;
        log::debug!("Next expiry at {}", next.to_rfc3339());
        Ok(Some(next))
    }

    async fn arm_local(&self, at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut local = self.local.lock().await;
        if let Some(previous) = local.take() {
            previous.abort();
        }

        let triggers = match &self.triggers {
            Some(triggers) => triggers.clone(),
            None => return,
        };
        let delay = clamp_delay(at, now);
        let name = self.timer_name.clone();
        *local = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = triggers.send(Trigger::TimerFired(name));
        }));
    }

    async fn cancel_local(&self) {
        if let Some(previous) = self.local.lock().await.take() {
            previous.abort();
        }
    }

    /// Whether an in-process timer is pending.
    pub async fn has_local_timer(&self) -> bool {
        match self.local.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.local.get_mut().take() {
            handle.abort();
        }
    }
}
