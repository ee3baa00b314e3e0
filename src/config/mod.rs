// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for medtrace.
//!
//! Handles loading and merging of telemetry settings from multiple sources:
//! - Global config: ~/.medtrace/config.json
//! - Local config: medtrace.json, medtrace.yaml, or .medtrace/config.json
//! - Environment: MEDTRACE_* variables
//!
//! Configuration is merged with precedence (env > local > global > defaults)
//! and never changes once a telemetry system is built from it.

mod loader;
mod merger;
mod types;

pub use loader::{
    env_overrides, find_config_file, get_global_config_path, load_config_file,
    load_global_config, overrides_from, save_config_file, CONFIG_FILES, ENV_PREFIX,
    GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};

pub use merger::{apply_partial, default_config, merge_config};

pub use types::{
    TelemetryConfigPartial, TelemetryConfiguration, DEFAULT_EXPORT_INTERVAL_MS,
    DEFAULT_EXPORT_TIMEOUT_MS, DEFAULT_MAX_SPANS,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources.
///
/// `explicit` names a config file that replaces the search in `dir`.
pub fn load_config(
    dir: &Path,
    explicit: Option<&Path>,
) -> Result<TelemetryConfiguration, ConfigError> {
    let global = load_global_config()?;
    let local = match explicit {
        Some(path) => Some(load_config_file(path)?),
        None => match find_config_file(dir) {
            Some(path) => Some(load_config_file(&path)?),
            None => None,
        },
    };
    let env = env_overrides()?;

    Ok(merge_config(global, local, env))
}
