// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the on-disk (partial) telemetry configuration and the resolved
//! configuration the telemetry system is constructed with. Both use camelCase
//! keys in JSON and YAML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::telemetry::AttributeValue;

/// Default export cadence.
pub const DEFAULT_EXPORT_INTERVAL_MS: u64 = 10_000;

/// Default capacity of the completed-span buffer.
pub const DEFAULT_MAX_SPANS: usize = 1000;

/// Default upper bound for a single HTTP export.
pub const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 5_000;

/// Telemetry configuration as written in a config file.
/// Every field is optional; missing fields fall back to lower-precedence layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,

    /// Deployment environment (development, staging, production)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Fraction of spans to record (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_performance_profiling: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_healthcare_audit: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_interval_ms: Option<u64>,

    /// Capacity of the completed-span buffer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_spans_per_trace: Option<usize>,

    /// Base URL of a Jaeger collector (without the /api/traces suffix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger_endpoint: Option<String>,

    /// Attributes stamped onto every sampled span
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_attributes: Option<BTreeMap<String, AttributeValue>>,

    /// Force-finish active spans older than this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abandoned_span_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_timeout_ms: Option<u64>,
}

/// Fully resolved, process-wide telemetry settings.
///
/// Fixed once a `TelemetrySystem` is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfiguration {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub sampling_rate: f64,
    pub enable_performance_profiling: bool,
    pub enable_healthcare_audit: bool,
    pub export_interval_ms: u64,
    pub max_spans_per_trace: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger_endpoint: Option<String>,
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abandoned_span_timeout_ms: Option<u64>,
    pub export_timeout_ms: u64,
}

impl Default for TelemetryConfiguration {
    fn default() -> Self {
        Self {
            service_name: "medtrace".to_string(),
            service_version: crate::VERSION.to_string(),
            environment: "development".to_string(),
            sampling_rate: 1.0,
            enable_performance_profiling: true,
            enable_healthcare_audit: true,
            export_interval_ms: DEFAULT_EXPORT_INTERVAL_MS,
            max_spans_per_trace: DEFAULT_MAX_SPANS,
            jaeger_endpoint: None,
            custom_attributes: BTreeMap::new(),
            abandoned_span_timeout_ms: None,
            export_timeout_ms: DEFAULT_EXPORT_TIMEOUT_MS,
        }
    }
}

impl TelemetryConfiguration {
    /// Create a configuration for the named service with default settings.
    pub fn for_service(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }

    /// Set the sampling rate.
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    /// Set the deployment environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the Jaeger collector endpoint.
    pub fn with_jaeger_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.jaeger_endpoint = Some(endpoint.into());
        self
    }

    /// Set the completed-span buffer capacity.
    pub fn with_max_spans(mut self, max: usize) -> Self {
        self.max_spans_per_trace = max;
        self
    }

    /// Enable or disable per-span resource profiling.
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.enable_performance_profiling = enabled;
        self
    }

    /// Set the export cadence.
    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Add an attribute stamped onto every sampled span.
    pub fn with_custom_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.custom_attributes.insert(key.into(), value.into());
        self
    }

    /// Whether this is a production deployment.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    pub fn abandoned_span_timeout(&self) -> Option<Duration> {
        self.abandoned_span_timeout_ms.map(Duration::from_millis)
    }

    /// Report suspicious settings.
    ///
    /// Nothing here is enforced at construction; callers decide what to do.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            warnings.push(format!(
                "samplingRate {} is outside 0.0-1.0 and will be clamped when sampling",
                self.sampling_rate
            ));
        }
        if self.export_interval_ms == 0 {
            warnings.push("exportIntervalMs is 0; the export loop will not start".to_string());
        }
        if self.max_spans_per_trace == 0 {
            warnings.push("maxSpansPerTrace is 0; every finished span is dropped".to_string());
        }
        if self.is_production() && self.jaeger_endpoint.is_none() {
            warnings.push(
                "production environment without jaegerEndpoint; spans go to the log only"
                    .to_string(),
            );
        }

        warnings
    }
}
