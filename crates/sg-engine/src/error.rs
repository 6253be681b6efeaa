//! Error types for the lifecycle engine
//!
//! None of these are user-facing: every failure degrades to "stale until the
//! next trigger" and is reported through the log.

use sg_compiler::RemoveError;

/// Persistent key-value store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read '{key}': {reason}")]
    Read { key: String, reason: String },
    #[error("Failed to write '{key}': {reason}")]
    Write { key: String, reason: String },
    #[error("Failed to serialize '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Enforcement layer failures.
#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    #[error("Duplicate rule id: {0}")]
    DuplicateId(u32),
    #[error("Rule update rejected: {0}")]
    Rejected(String),
}

/// Durable timer failures.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Failed to arm timer '{name}': {reason}")]
    Arm { name: String, reason: String },
    #[error("Failed to clear timer '{name}': {reason}")]
    Clear { name: String, reason: String },
}

/// Top-level error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("Enforcement failure: {0}")]
    Enforcement(#[from] EnforcementError),
    #[error("Scheduling failure: {0}")]
    Scheduling(#[from] TimerError),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error(transparent)]
    Remove(#[from] RemoveError),
}
