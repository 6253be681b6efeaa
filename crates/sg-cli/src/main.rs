//! SiteGate CLI
//!
//! Runs the rule compiler and the lifecycle engine against a state directory
//! that stands in for the browser host.

mod state;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use sg_compiler::{compile, normalize_with_stats, translate, UpsertOutcome};
use sg_core::config::EngineConfig;
use sg_core::expiry::is_active;
use sg_core::types::{EntryKey, RequestType};
use sg_engine::{Engine, SyncReport};

use crate::state::{FileEnforcement, FileStore, FileTimers};

#[derive(Parser)]
#[command(name = "sitegate")]
#[command(about = "SiteGate rule compiler and lifecycle tools")]
struct Cli {
    /// Directory holding storage.json, rules.json and alarms.json
    #[arg(long, global = true, default_value = ".sitegate")]
    state_dir: PathBuf,

    /// Engine config (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the match expression for a wildcard pattern
    Translate { pattern: String },

    /// Normalize a JSON entry list
    Normalize {
        /// Input JSON file
        #[arg(short, long)]
        input: String,
    },

    /// Compile a JSON entry list into enforcement rules
    Compile {
        /// Input JSON file
        #[arg(short, long)]
        input: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Add an entry and resync
    Add {
        /// Host, URL or wildcard pattern
        value: String,

        /// Treat the value as a wildcard pattern
        #[arg(long)]
        pattern: bool,

        /// Expiry as RFC 3339 or epoch milliseconds
        #[arg(long, conflicts_with = "minutes")]
        expires: Option<String>,

        /// Expire after this many minutes
        #[arg(long)]
        minutes: Option<i64>,

        /// Require the master PIN to remove
        #[arg(long)]
        protect: bool,

        /// Hide these selectors instead of blocking
        #[arg(long = "hide")]
        selectors: Vec<String>,
    },

    /// Remove an entry by key (`domain:example.com`) and resync
    Remove {
        key: String,

        /// The PIN check already succeeded
        #[arg(long)]
        pin_verified: bool,
    },

    /// List stored entries
    List,

    /// Rebuild the installed rule set from storage
    Sync,

    /// Record a rule-matched notification
    Hit { rule_id: i64, url: String },

    /// Show hit logs
    Logs {
        /// Only this entry key
        key: Option<String>,
    },

    /// Evaluate a request against the installed rules and log the hit
    Match {
        url: String,

        /// Resource type
        #[arg(short = 't', long = "type", default_value = "main_frame")]
        resource_type: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Translate { pattern } => cmd_translate(&pattern),
        Commands::Normalize { input } => cmd_normalize(&input, &config),
        Commands::Compile { input, output } => cmd_compile(&input, output.as_deref(), &config),
        command => run_async(run_stateful(command, cli.state_dir, config)),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run_async<F>(future: F) -> Result<(), String>
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(future)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    let path = match path {
        Some(path) => path,
        None => return Ok(EngineConfig::default()),
    };
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    let config =
        EngineConfig::from_json(&text).map_err(|e| format!("'{}': {}", path.display(), e))?;
    log::debug!("Loaded config from '{}'", path.display());
    Ok(config)
}

fn read_entries(path: &str) -> Result<Value, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    serde_json::from_str(&text).map_err(|e| format!("Failed to parse '{}': {}", path, e))
}

fn to_pretty<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize JSON: {}", e))
}

// =============================================================================
// Stateless commands
// =============================================================================

fn cmd_translate(pattern: &str) -> Result<(), String> {
    println!("{}", translate(pattern));
    Ok(())
}

fn cmd_normalize(input: &str, config: &EngineConfig) -> Result<(), String> {
    let raw = read_entries(input)?;
    let (entries, stats) = normalize_with_stats(&raw, config);

    println!("{}", to_pretty(&entries)?);
    eprintln!(
        "Normalized {} items: {} kept, {} dropped, {} merged, {} truncated",
        stats.raw,
        entries.len(),
        stats.dropped,
        stats.merged,
        stats.truncated
    );
    Ok(())
}

fn cmd_compile(input: &str, output: Option<&str>, config: &EngineConfig) -> Result<(), String> {
    let raw = read_entries(input)?;
    let now = Utc::now();
    let (entries, _) = normalize_with_stats(&raw, config);
    let active: Vec<_> = entries.into_iter().filter(|e| is_active(e, now)).collect();
    let compilation = compile(&active, config);

    let text = to_pretty(&json!({
        "rules": compilation.rules,
        "ruleIdToEntryKey": compilation.rule_map,
    }))?;

    match output {
        Some(path) => {
            fs::write(path, text).map_err(|e| format!("Failed to write '{}': {}", path, e))?;
            println!("Compiled {} entries to '{}'", active.len(), path);
            println!("  Rules:     {}", compilation.rules.len());
            if compilation.truncated {
                println!("  Truncated: rule ceiling of {} reached", config.max_rules);
            }
        }
        None => println!("{}", text),
    }
    Ok(())
}

// =============================================================================
// Stateful commands
// =============================================================================

async fn open_engine(
    state_dir: &Path,
    config: EngineConfig,
) -> Result<(Engine, Arc<FileEnforcement>, Arc<FileTimers>), String> {
    tokio::fs::create_dir_all(state_dir)
        .await
        .map_err(|e| format!("Failed to create '{}': {}", state_dir.display(), e))?;

    let store = Arc::new(FileStore::open(state_dir).await?);
    let enforcement = Arc::new(FileEnforcement::open(state_dir).await?);
    let timers = Arc::new(FileTimers::open(state_dir).await?);
    let engine = Engine::new(store, enforcement.clone(), timers.clone(), config);
    log::debug!("Opened state in '{}'", state_dir.display());
    Ok((engine, enforcement, timers))
}

async fn run_stateful(command: Commands, state_dir: PathBuf, config: EngineConfig) -> Result<(), String> {
    let (engine, enforcement, timers) = open_engine(&state_dir, config).await?;

    match command {
        Commands::Add {
            value,
            pattern,
            expires,
            minutes,
            protect,
            selectors,
        } => {
            let raw = entry_json(&value, pattern, expires, minutes, protect, selectors);
            let outcome = engine.add_entry(&raw).await.map_err(|e| e.to_string())?;
            match outcome {
                UpsertOutcome::Inserted => println!("Added {}", value),
                UpsertOutcome::Merged => println!("Updated {}", value),
            }
            print_report(&engine.rebuild().await.map_err(|e| e.to_string())?);
        }
        Commands::Remove { key, pin_verified } => {
            let key = EntryKey::from(key.as_str());
            engine
                .remove_entry(&key, pin_verified)
                .await
                .map_err(|e| e.to_string())?;
            println!("Removed {}", key);
            print_report(&engine.rebuild().await.map_err(|e| e.to_string())?);
        }
        Commands::List => {
            let now = Utc::now();
            let entries = engine.entries().await.map_err(|e| e.to_string())?;
            if entries.is_empty() {
                println!("No entries");
            }
            for entry in &entries {
                let expiry = match entry.expires_at {
                    Some(at) if at <= now => "expired".to_string(),
                    Some(at) => format!("until {}", at.to_rfc3339()),
                    None => "indefinite".to_string(),
                };
                let mut flags = vec![entry.action.as_str().to_string(), expiry];
                if entry.requires_master_pin {
                    flags.push("protected".to_string());
                }
                println!("{}  [{}]", entry.key(), flags.join(", "));
                if let Some(selectors) = &entry.selectors {
                    println!("    selectors: {}", selectors.join(" "));
                }
            }
        }
        Commands::Sync => {
            print_report(&engine.rebuild().await.map_err(|e| e.to_string())?);
            for (name, at) in timers.all().await {
                println!("  Alarm:     {} at {}", name, at.to_rfc3339());
            }
        }
        Commands::Hit { rule_id, url } => {
            engine.record_hit(rule_id, &url);
            engine.flush_hits().await;
            println!("Recorded hit for rule {}", rule_id);
        }
        Commands::Logs { key } => {
            let logs = engine.logs().await.map_err(|e| e.to_string())?;
            let logs: Map<String, Value> = logs
                .into_iter()
                .filter(|(k, _)| key.as_deref().map_or(true, |want| k.as_str() == want))
                .map(|(k, bucket)| (k.as_str().to_string(), json!(bucket)))
                .collect();
            println!("{}", to_pretty(&logs)?);
        }
        Commands::Match { url, resource_type } => {
            let kind = RequestType::from_resource_type(&resource_type);
            if kind == RequestType::OTHER && resource_type != "other" {
                log::warn!("Unknown resource type '{}'; treating as other", resource_type);
            }
            match enforcement.evaluate(&url, kind).await {
                Some(rule) => {
                    engine.record_hit(i64::from(rule.id), &url);
                    engine.flush_hits().await;
                    let verdict = if rule.is_redirect() { "redirect" } else { "block" };
                    println!("{} by rule {} (priority {})", verdict, rule.id, rule.priority);
                }
                None => println!("allow"),
            }
        }
        Commands::Translate { .. } | Commands::Normalize { .. } | Commands::Compile { .. } => {}
    }

    Ok(())
}

fn entry_json(
    value: &str,
    pattern: bool,
    expires: Option<String>,
    minutes: Option<i64>,
    protect: bool,
    selectors: Vec<String>,
) -> Value {
    let mut entry = Map::new();
    entry.insert("type".into(), json!(if pattern { "pattern" } else { "domain" }));
    entry.insert("value".into(), json!(value));

    let expires = match (expires, minutes) {
        (Some(at), _) => Some(json!(at)),
        (None, Some(minutes)) => Some(json!((Utc::now() + Duration::minutes(minutes)).to_rfc3339())),
        (None, None) => None,
    };
    if let Some(at) = expires {
        entry.insert("expiresAt".into(), at);
    }
    if protect {
        entry.insert("requiresMasterPin".into(), json!(true));
    }
    if !selectors.is_empty() {
        entry.insert("action".into(), json!("hide-elements"));
        entry.insert("selectors".into(), json!(selectors));
    }
    Value::Object(entry)
}

fn print_report(report: &SyncReport) {
    println!("Synced {} active entries", report.active_entries);
    println!("  Rules:     {} installed, {} replaced", report.rules_installed, report.rules_removed);
    if report.expired_entries > 0 {
        println!("  Expired:   {}", report.expired_entries);
    }
    if report.buckets_pruned > 0 {
        println!("  Pruned:    {} log buckets", report.buckets_pruned);
    }
    if report.truncated {
        println!("  Truncated: rule ceiling reached");
    }
    if let Some(next) = report.next_expiry {
        println!("  Next expiry: {}", next.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_compiler::normalize;

    #[test]
    fn entry_json_normalizes() {
        let raw = entry_json("https://www.Example.com/x", false, None, Some(30), true, vec![]);
        let entries = normalize(&json!([raw]), &EngineConfig::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "example.com");
        assert!(entries[0].requires_master_pin);
        assert!(entries[0].expires_at.is_some());
    }

    #[test]
    fn hide_flag_sets_action() {
        let raw = entry_json("news.com", false, None, None, false, vec![".ad".into()]);
        assert_eq!(raw["action"], "hide-elements");
        assert_eq!(raw["selectors"], json!([".ad"]));
    }

    #[tokio::test]
    async fn add_then_match_records_hit() {
        let dir = std::env::temp_dir().join(format!("sitegate-cli-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let (engine, enforcement, _) = open_engine(&dir, EngineConfig::default()).await.unwrap();
        let raw = entry_json("example.com", false, None, None, false, vec![]);
        engine.add_entry(&raw).await.unwrap();
        engine.rebuild().await.unwrap();

        let rule = enforcement
            .evaluate("https://example.com/", RequestType::MAIN_FRAME)
            .await
            .unwrap();
        engine.record_hit(i64::from(rule.id), "https://example.com/");
        engine.flush_hits().await;
        drop(engine);

        let (reopened, _, _) = open_engine(&dir, EngineConfig::default()).await.unwrap();
        let logs = reopened.logs().await.unwrap();
        assert_eq!(logs[&EntryKey::from("domain:example.com")][0].count, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
