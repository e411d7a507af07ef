//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RapportSettings::default()`]
//! 2. If `~/.rapport/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RapportSettings;

/// Accepted provider timeout range in milliseconds, for the file and the env var.
const TIMEOUT_MS_MIN: u64 = 100;
const TIMEOUT_MS_MAX: u64 = 600_000;

/// `~/.rapport`, falling back to `/tmp/.rapport` without a home directory.
pub fn rapport_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".rapport")
}

/// Resolve the path to the settings file (`~/.rapport/settings.json`).
pub fn settings_path() -> PathBuf {
    rapport_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RapportSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RapportSettings> {
    let mut settings = load_file_layer(path)?;
    clamp_file_values(&mut settings);
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<RapportSettings> {
    let defaults = serde_json::to_value(RapportSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Pull out-of-range file values back into range.
fn clamp_file_values(settings: &mut RapportSettings) {
    let timeout_ms = settings.provider.timeout_ms;
    let clamped = timeout_ms.clamp(TIMEOUT_MS_MIN, TIMEOUT_MS_MAX);
    if clamped != timeout_ms {
        tracing::warn!(timeout_ms, clamped, "provider.timeoutMs out of range, clamping");
        settings.provider.timeout_ms = clamped;
    }
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut RapportSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and leave the file/default
/// value in place.
pub fn apply_overrides_from<F>(settings: &mut RapportSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Provider ────────────────────────────────────────────────────
    if let Some(v) = string("RAPPORT_PROVIDER_URL") {
        settings.provider.base_url = v;
    }
    if let Some(v) = string("RAPPORT_MODEL") {
        settings.provider.model = v;
    }
    if let Some(v) = string("RAPPORT_PROVIDER_TIMEOUT_MS") {
        let parsed = parse_u64_range(&v, TIMEOUT_MS_MIN, TIMEOUT_MS_MAX);
        if let Some(ms) = checked("RAPPORT_PROVIDER_TIMEOUT_MS", &v, parsed) {
            settings.provider.timeout_ms = ms;
        }
    }
    if let Some(v) = string("RAPPORT_PROVIDER_ENABLED") {
        if let Some(enabled) = checked("RAPPORT_PROVIDER_ENABLED", &v, parse_bool(&v)) {
            settings.provider.enabled = enabled;
        }
    }
    if let Some(key) = string("RAPPORT_API_KEY").or_else(|| string("OPENAI_API_KEY")) {
        settings.provider.api_key = Some(key);
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = string("RAPPORT_DB_PATH") {
        settings.store.db_path = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("RAPPORT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = string("RAPPORT_LOG_JSON") {
        if let Some(json) = checked("RAPPORT_LOG_JSON", &v, parse_bool(&v)) {
            settings.logging.json = json;
        }
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
