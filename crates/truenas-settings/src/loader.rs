//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.truenas/client.json` exists, deep-merge user values over defaults
//! 3. Apply `TRUENAS_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ClientSettings;

/// Resolve the path to the settings file (`~/.truenas/client.json`).
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".truenas")
        .join("client.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If the
/// file contains invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    if !path.exists() {
        debug!(path = %path.display(), "no settings file");
        return Ok(serde_json::from_value(defaults)?);
    }
    let overlay: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    debug!(path = %path.display(), "settings file merged over defaults");
    Ok(serde_json::from_value(deep_merge(defaults, overlay))?)
}

/// Layer `overlay` on top of `base`.
///
/// Objects merge key by key, `null` in `overlay` keeps the base value, and
/// anything else in `overlay` replaces the base value outright.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `TRUENAS_*` environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("TRUENAS_HOST") {
        settings.host = v;
    }
    if let Some(v) = env.bool("TRUENAS_SECURE") {
        settings.secure = v;
    }
    if let Some(v) = env.u64("TRUENAS_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.handshake_timeout_ms = v;
    }
    if let Some(v) = env.string("TRUENAS_LOG_LEVEL") {
        settings.log_level = v;
    }

    // ── Credentials ─────────────────────────────────────────────────
    if let Some(v) = env.string("TRUENAS_USERNAME") {
        settings.credentials.username = Some(v);
    }
    if let Some(v) = env.string("TRUENAS_PASSWORD") {
        settings.credentials.password = Some(v);
    }
    if let Some(v) = env.string("TRUENAS_API_KEY") {
        settings.credentials.api_key = Some(v);
    }
    if let Some(v) = env.string("TRUENAS_TOKEN") {
        settings.credentials.token = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim().parse::<u64>().ok().filter(|n| (min..=max).contains(n))
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let raw = (self.lookup)(name)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(var = name, value = %raw, "not a boolean, ignored");
        }
        parsed
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let raw = (self.lookup)(name)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            warn!(var = name, value = %raw, min, max, "not an integer in range, ignored");
        }
        parsed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn nested_objects_merge_per_key() {
        let target = serde_json::json!({"credentials": {"username": "root", "password": "x"}});
        let source = serde_json::json!({"credentials": {"password": "y"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["credentials"]["username"], "root");
        assert_eq!(merged["credentials"]["password"], "y");
    }

    #[test]
    fn null_overlay_keeps_base_and_scalars_replace() {
        let base = serde_json::json!({"host": "nas", "secure": true, "tags": ["a", "b"]});
        let overlay = serde_json::json!({"host": null, "secure": false, "tags": ["c"]});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["host"], "nas");
        assert_eq!(merged["secure"], false);
        assert_eq!(merged["tags"], serde_json::json!(["c"]));
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_means_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/client.json")).unwrap();
        assert_eq!(settings.host, ClientSettings::default().host);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{"host": "nas.local", "secure": false, "credentials": {"username": "root", "password": "pw"}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.host, "nas.local");
        assert!(!settings.secure);
        assert_eq!(settings.handshake_timeout_ms, 10_000);
        assert_eq!(settings.credentials().unwrap().kind(), "password");
    }

    #[test]
    fn malformed_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "{host: nas").unwrap();
        assert_matches!(load_file_layer(&path).unwrap_err(), SettingsError::Json(_));
    }

    #[test]
    fn load_rejects_zero_command_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"commandBuffer": 0}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path).unwrap_err(),
            SettingsError::InvalidValue(_)
        );
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = ClientSettings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("TRUENAS_HOST", "10.0.0.5"),
                ("TRUENAS_SECURE", "off"),
                ("TRUENAS_HANDSHAKE_TIMEOUT_MS", "2500"),
                ("TRUENAS_API_KEY", "1-key"),
            ]),
        );
        assert_eq!(s.host, "10.0.0.5");
        assert!(!s.secure);
        assert_eq!(s.handshake_timeout_ms, 2500);
        assert_eq!(s.credentials.api_key.as_deref(), Some("1-key"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = ClientSettings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("TRUENAS_SECURE", "maybe"),
                ("TRUENAS_HANDSHAKE_TIMEOUT_MS", "5"),
                ("TRUENAS_HOST", ""),
            ]),
        );
        assert!(s.secure);
        assert_eq!(s.handshake_timeout_ms, 10_000);
        assert_eq!(s.host, "localhost");
    }

    #[test]
    fn env_credentials_can_conflict_with_file() {
        let mut s = ClientSettings::default();
        s.credentials.username = Some("root".into());
        s.credentials.password = Some("pw".into());
        apply_overrides_from(&mut s, env(&[("TRUENAS_TOKEN", "tok")]));
        assert_matches!(s.credentials().unwrap_err(), SettingsError::Credentials(_));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_values() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("100", 100, 200), Some(100));
        assert_eq!(parse_u64_range("201", 100, 200), None);
        assert_eq!(parse_u64_range("-1", 0, 200), None);
    }
}
