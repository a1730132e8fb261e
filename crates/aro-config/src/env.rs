//! `ARO_*` environment overrides.
//!
//! Overrides are applied to the merged TOML tree before deserialization, so
//! they go through the same type checks as file values. The variable map is
//! passed in explicitly; callers that want the real process environment use
//! [`collect_env_vars`].

use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};

/// Prefix shared by every recognised variable.
pub const ENV_PREFIX: &str = "ARO_";

/// How an override's raw string is turned into a TOML value.
#[derive(Clone, Copy)]
enum Kind {
    Str,
    Int,
    PathList,
}

/// Variable name → (dotted config path, value kind).
const OVERRIDES: &[(&str, &str, Kind)] = &[
    ("ARO_LOG_LEVEL", "logging.level", Kind::Str),
    ("ARO_LOG_FORMAT", "logging.format", Kind::Str),
    ("ARO_LOG_DIR", "logging.directory", Kind::Str),
    ("ARO_PLUGIN_DIRS", "plugins.directories", Kind::PathList),
    ("ARO_LOAD_FAILURE_POLICY", "plugins.load_failure_policy", Kind::Str),
    ("ARO_BUILTIN_SHADOWING", "plugins.builtin_shadowing", Kind::Str),
    ("ARO_HANDSHAKE_TIMEOUT_MS", "subprocess.handshake_timeout_ms", Kind::Int),
    ("ARO_CALL_TIMEOUT_MS", "subprocess.call_timeout_ms", Kind::Int),
    ("ARO_NATIVE_CALL_TIMEOUT_MS", "native.call_timeout_ms", Kind::Int),
];

/// Snapshot every `ARO_*` variable from the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Apply the recognised overrides in `env` to `merged`.
///
/// Returns how many fields were overridden.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a numeric variable does not parse.
pub fn apply_env_overrides(
    merged: &mut toml::Value,
    env: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0usize;
    for (var, path, kind) in OVERRIDES {
        let Some(raw) = env.get(*var) else {
            continue;
        };
        let value = match kind {
            Kind::Str => toml::Value::String(raw.clone()),
            Kind::Int => {
                let n: i64 = raw.trim().parse().map_err(|_| ConfigError::EnvError {
                    var: (*var).to_owned(),
                    message: format!("expected an integer, got '{raw}'"),
                })?;
                toml::Value::Integer(n)
            },
            Kind::PathList => toml::Value::Array(
                std::env::split_paths(raw)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| toml::Value::String(p.display().to_string()))
                    .collect(),
            ),
        };
        set_path(merged, path, value);
        tracing::debug!(var = *var, field = *path, "applied environment override");
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

/// Set a dotted path in a TOML tree, creating intermediate tables.
fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments = path.split('.').peekable();
    let mut cursor = root;
    while let Some(segment) = segments.next() {
        if !cursor.is_table() {
            *cursor = toml::Value::Table(toml::map::Map::new());
        }
        let toml::Value::Table(table) = cursor else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        cursor = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_string_override_creates_tables() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let n = apply_env_overrides(&mut merged, &env(&[("ARO_LOG_LEVEL", "debug")])).unwrap();
        assert_eq!(n, 1);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
    }

    #[test]
    fn test_int_override() {
        let mut merged: toml::Value = toml::from_str("[subprocess]\ncall_timeout_ms = 1").unwrap();
        apply_env_overrides(&mut merged, &env(&[("ARO_CALL_TIMEOUT_MS", "250")])).unwrap();
        assert_eq!(merged["subprocess"]["call_timeout_ms"].as_integer(), Some(250));
    }

    #[test]
    fn test_bad_int_is_error() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let err = apply_env_overrides(&mut merged, &env(&[("ARO_CALL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { ref var, .. } if var == "ARO_CALL_TIMEOUT_MS"));
    }

    #[cfg(unix)]
    #[test]
    fn test_path_list_split() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        apply_env_overrides(&mut merged, &env(&[("ARO_PLUGIN_DIRS", "/a:/b::")])).unwrap();
        let dirs: Vec<_> = merged["plugins"]["directories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(dirs, vec!["/a", "/b"]);
    }

    #[test]
    fn test_unrelated_vars_ignored() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let n = apply_env_overrides(&mut merged, &env(&[("ARO_UNKNOWN", "x")])).unwrap();
        assert_eq!(n, 0);
    }
}
