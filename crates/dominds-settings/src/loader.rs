//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::DomindsSettings;

/// `~/.dominds`
pub fn dominds_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".dominds")
}

pub fn settings_path() -> PathBuf {
    dominds_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DomindsSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DomindsSettings> {
    let defaults = serde_json::to_value(DomindsSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DomindsSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.team.validate()?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DOMINDS_*` overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut DomindsSettings) {
    if let Some(v) = read_env_string("DOMINDS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("DOMINDS_DB_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = read_env_u64("DOMINDS_SWEEP_INTERVAL_MS", 10, 600_000) {
        settings.revival.sweep_interval_ms = v;
    }
    if let Some(v) = read_env_string("DOMINDS_WORK_LANGUAGE") {
        settings.driver.work_language = v;
    }
    if let Some(v) = read_env_u32("DOMINDS_MAX_RETRY_ATTEMPTS", 1, 20) {
        settings.driver.max_retry_attempts = v;
    }
    if let Some(v) = read_env_bool("DOMINDS_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

/// Resolved database path: the configured one, or the default under
/// [`dominds_home`].
pub fn database_path(settings: &DomindsSettings) -> PathBuf {
    if settings.storage.database_path.is_empty() {
        dominds_home().join("database").join("dominds.db")
    } else {
        PathBuf::from(&settings.storage.database_path)
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
