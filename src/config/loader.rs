// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files and the environment.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::TelemetryConfigPartial;

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    "medtrace.json",
    "medtrace.yaml",
    "medtrace.yml",
    ".medtrace/config.json",
];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".medtrace";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "MEDTRACE_";

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR).join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.medtrace/config.json.
pub fn load_global_config() -> Result<Option<TelemetryConfigPartial>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Find the first config file present in `dir`.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<TelemetryConfigPartial, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Read `MEDTRACE_*` overrides from the process environment.
pub fn env_overrides() -> Result<TelemetryConfigPartial, ConfigError> {
    overrides_from(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
}

/// Build overrides from an arbitrary variable lookup.
///
/// `lookup` receives the variable name without the `MEDTRACE_` prefix.
pub fn overrides_from<F>(lookup: F) -> Result<TelemetryConfigPartial, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    Ok(TelemetryConfigPartial {
        service_name: get("SERVICE_NAME"),
        service_version: get("SERVICE_VERSION"),
        environment: get("ENVIRONMENT"),
        sampling_rate: parse_var(get("SAMPLING_RATE"), "MEDTRACE_SAMPLING_RATE")?,
        export_interval_ms: parse_var(get("EXPORT_INTERVAL_MS"), "MEDTRACE_EXPORT_INTERVAL_MS")?,
        max_spans_per_trace: parse_var(get("MAX_SPANS"), "MEDTRACE_MAX_SPANS")?,
        jaeger_endpoint: get("JAEGER_ENDPOINT"),
        ..Default::default()
    })
}

fn parse_var<T>(raw: Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(name, format!("{value:?}: {e}")))
    })
    .transpose()
}

/// Save a partial configuration as pretty JSON.
pub fn save_config_file(path: &Path, config: &TelemetryConfigPartial) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_load_json_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("medtrace.json");
        std::fs::write(&path, r#"{"serviceName": "ehr-api", "maxSpansPerTrace": 50}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.service_name.as_deref(), Some("ehr-api"));
        assert_eq!(config.max_spans_per_trace, Some(50));
    }

    #[test]
    fn test_load_yaml_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("medtrace.yaml");
        std::fs::write(
            &path,
            "serviceName: scheduling\nenvironment: production\njaegerEndpoint: http://jaeger:14268\n",
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.service_name.as_deref(), Some("scheduling"));
        assert_eq!(config.environment.as_deref(), Some("production"));
        assert_eq!(config.jaeger_endpoint.as_deref(), Some("http://jaeger:14268"));
    }

    #[test]
    fn test_load_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("medtrace.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = load_config_file(&path);
        assert!(matches!(result, Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = load_config_file(&temp.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_find_config_file_order() {
        let temp = TempDir::new().unwrap();
        assert!(find_config_file(temp.path()).is_none());

        std::fs::write(temp.path().join("medtrace.yaml"), "serviceName: a\n").unwrap();
        std::fs::write(temp.path().join("medtrace.json"), "{}").unwrap();

        let found = find_config_file(temp.path()).unwrap();
        assert!(found.ends_with("medtrace.json"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("medtrace.json");
        let config = TelemetryConfigPartial {
            sampling_rate: Some(0.5),
            ..Default::default()
        };

        save_config_file(&path, &config).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SERVICE_NAME", "billing"),
            ("SAMPLING_RATE", "0.2"),
            ("MAX_SPANS", "64"),
            ("ENVIRONMENT", "  "),
        ]
        .into_iter()
        .collect();

        let overrides = overrides_from(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(overrides.service_name.as_deref(), Some("billing"));
        assert_eq!(overrides.sampling_rate, Some(0.2));
        assert_eq!(overrides.max_spans_per_trace, Some(64));
        assert_eq!(overrides.environment, None);
    }

    #[test]
    fn test_overrides_reject_bad_number() {
        let result = overrides_from(|key| {
            (key == "EXPORT_INTERVAL_MS").then(|| "soon".to_string())
        });
        match result {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "MEDTRACE_EXPORT_INTERVAL_MS")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }
}
