//! SiteGate Core Library
//!
//! This crate provides the shared data model for the SiteGate rule engine:
//! user entries, compiled enforcement rules, hit-log buckets and the small
//! amount of URL handling they need.
//!
//! # Modules
//!
//! - `types`: Entries, entry keys, compiled rules and log records
//! - `url`: Host extraction and domain canonicalization
//! - `expiry`: Expiry instant parsing and scheduling helpers
//! - `logs`: Bounded, recency-ordered log bucket updates
//! - `config`: Engine limits and storage keys

pub mod config;
pub mod expiry;
pub mod logs;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use types::{
    CompiledRule, Entry, EntryAction, EntryKey, EntryType, LogBucket, LogBuckets, LogRecord,
    RequestType, RuleAction, RuleCondition, RuleIdMap,
};
