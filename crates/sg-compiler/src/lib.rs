//! SiteGate Rule Compiler
//!
//! This crate turns stored user entries into the enforcement rules handed to
//! the host's network-filtering layer.

pub mod compiler;
pub mod merge;
pub mod normalizer;
pub mod pattern;

pub use compiler::{compile, Compilation};
pub use merge::{hide_element_entries, merge_entry, remove_entry, upsert_entry, RemoveError, UpsertOutcome};
pub use normalizer::{normalize, normalize_with_stats, NormalizeStats};
pub use pattern::{translate, PatternError};
