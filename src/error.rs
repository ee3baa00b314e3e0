// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for medtrace.
//!
//! Telemetry infrastructure failures are modelled here with `thiserror`, but
//! they never cross the public span API: the system logs and drops them.
//! Application-level glue (the CLI) propagates with `anyhow`.

use thiserror::Error;

/// Errors raised inside the telemetry pipeline.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Export to {sink} failed: {message}")]
    Export { sink: String, message: String },

    #[error("Export rejected with status {status}: {body}")]
    ExportStatus { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TelemetryError {
    /// Create an export error for the named sink.
    pub fn export(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Export {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Whether a later attempt could plausibly succeed.
    ///
    /// Export is at-most-once, so this only feeds diagnostics.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::ExportStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid-value error for a field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
