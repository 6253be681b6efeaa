//! SiteGate Engine - rule lifecycle
//!
//! Keeps the host's enforcement layer in step with the stored entries:
//! - Full rebuild on startup, resume, entry changes and expiry
//! - Durable plus in-process expiry timers
//! - Serialized hit logging per logical rule
//!
//! The host's storage, enforcement layer and durable timers are reached
//! through the traits in [`store`], [`enforcement`] and [`timer`]. In-memory
//! implementations of all three ship with the crate.

pub mod enforcement;
pub mod engine;
pub mod error;
pub mod hits;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod timer;

pub use enforcement::{EnforcementLayer, MemoryEnforcement, RuleMatch};
pub use engine::{Engine, Trigger};
pub use error::{EnforcementError, EngineError, StoreError, TimerError};
pub use hits::{apply_hit, apply_prune, HitLogger, HitOutcome};
pub use scheduler::ExpiryScheduler;
pub use store::{read_json, write_json, KeyValueStore, MemoryStore, StorageArea, StorageChange};
pub use sync::{SyncOrchestrator, SyncReport};
pub use timer::{DurableTimers, MemoryTimers};
