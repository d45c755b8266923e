//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BRIDGE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use bridge_core::ApiKey;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::BridgeSettings;

/// Resolve the default settings file path (`~/.bridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env). If the file
/// contains invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Defaults with the file deep-merged over them. No env overrides.
pub fn load_file_layer(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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

/// Reject settings the bridge cannot run with.
pub fn validate(settings: &BridgeSettings) -> Result<()> {
    if settings.server.api_key.expose().trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.apiKey must not be empty".into()));
    }
    if !settings.backend.base_url.starts_with("http://")
        && !settings.backend.base_url.starts_with("https://")
    {
        return Err(SettingsError::InvalidValue(format!(
            "backend.baseUrl must be an http(s) URL, got {}",
            settings.backend.base_url
        )));
    }
    if settings.sessions.event_buffer == 0 || settings.sessions.command_buffer == 0 {
        return Err(SettingsError::InvalidValue("session buffers must be non-zero".into()));
    }
    Ok(())
}

/// Apply environment overrides read through `lookup`.
///
/// Each variable has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (file/default value stays)
pub fn apply_overrides(settings: &mut BridgeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("BRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("BRIDGE_PORT", 1, 65535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("BRIDGE_API_KEY") {
        settings.server.api_key = ApiKey::new(v);
    }

    // ── Backend ─────────────────────────────────────────────────────
    if let Some(v) = env.string("BRIDGE_BACKEND_URL") {
        settings.backend.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = env.string("BRIDGE_BACKEND_API_KEY") {
        settings.backend.api_key = ApiKey::new(v);
    }
    if let Some(v) = env.u64_in("BRIDGE_BACKEND_TIMEOUT_MS", 500, 120_000) {
        settings.backend.timeout_ms = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("BRIDGE_RECONNECT_DELAY_MS", 0, 600_000) {
        settings.sessions.reconnect_delay_ms = v;
    }
    if let Some(v) = env.u64_in("BRIDGE_KEY_FLUSH_MS", 10, 60_000) {
        settings.sessions.key_flush_ms = v;
    }
    if let Some(v) = env.u64_in("BRIDGE_RESTORE_SPACING_MS", 0, 60_000) {
        settings.sessions.restore_spacing_ms = v;
    }
    if let Some(v) = env.string("BRIDGE_SIDECAR_URL") {
        settings.sessions.sidecar_url = v.trim_end_matches('/').to_string();
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("BRIDGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("BRIDGE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
