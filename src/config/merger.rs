// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use super::types::{TelemetryConfigPartial, TelemetryConfiguration};

/// Default configuration values.
pub fn default_config() -> TelemetryConfiguration {
    TelemetryConfiguration::default()
}

/// Merge configuration layers with precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment overrides (MEDTRACE_*)
/// 2. Local config (medtrace.json / medtrace.yaml)
/// 3. Global config (~/.medtrace/config.json)
/// 4. Default values
pub fn merge_config(
    global: Option<TelemetryConfigPartial>,
    local: Option<TelemetryConfigPartial>,
    env: TelemetryConfigPartial,
) -> TelemetryConfiguration {
    let mut result = default_config();

    if let Some(config) = global {
        apply_partial(&mut result, &config);
    }

    if let Some(config) = local {
        apply_partial(&mut result, &config);
    }

    apply_partial(&mut result, &env);

    result
}

/// Apply the fields a partial layer sets on top of `result`.
pub fn apply_partial(result: &mut TelemetryConfiguration, config: &TelemetryConfigPartial) {
    if let Some(ref name) = config.service_name {
        result.service_name = name.clone();
    }

    if let Some(ref version) = config.service_version {
        result.service_version = version.clone();
    }

    if let Some(ref environment) = config.environment {
        result.environment = environment.clone();
    }

    if let Some(rate) = config.sampling_rate {
        result.sampling_rate = rate;
    }

    if let Some(enabled) = config.enable_performance_profiling {
        result.enable_performance_profiling = enabled;
    }

    if let Some(enabled) = config.enable_healthcare_audit {
        result.enable_healthcare_audit = enabled;
    }

    if let Some(interval) = config.export_interval_ms {
        result.export_interval_ms = interval;
    }

    if let Some(max) = config.max_spans_per_trace {
        result.max_spans_per_trace = max;
    }

    if config.jaeger_endpoint.is_some() {
        result.jaeger_endpoint = config.jaeger_endpoint.clone();
    }

    if let Some(ref attributes) = config.custom_attributes {
        // Attribute maps merge key by key
        for (key, value) in attributes {
            result.custom_attributes.insert(key.clone(), value.clone());
        }
    }

    if config.abandoned_span_timeout_ms.is_some() {
        result.abandoned_span_timeout_ms = config.abandoned_span_timeout_ms;
    }

    if let Some(timeout) = config.export_timeout_ms {
        result.export_timeout_ms = timeout;
    }
}
