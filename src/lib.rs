// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Medtrace - distributed tracing for clinical services.
//!
//! Spans with attributes, events and links; parent/child trace context;
//! per-operation resource profiling; HIPAA-oriented audit events; batched
//! export in Jaeger JSON form.
//!
//! # Architecture
//!
//! - [`telemetry`] - spans, context, profiler, export and the telemetry system
//! - [`config`] - configuration defaults, files and environment overrides
//! - [`error`] - error types and result aliases
//! - [`logging`] - diagnostic log output
//!
//! # Example
//!
//! ```rust,ignore
//! use medtrace::config::TelemetryConfiguration;
//! use medtrace::telemetry::{initialize_telemetry, shutdown_telemetry};
//!
//! let telemetry = initialize_telemetry(TelemetryConfiguration::for_service("ehr-api"));
//! let span = telemetry.trace_phi_data_access("chart_read", "patient-42", "vitals", "treatment");
//! telemetry.finish_span(&span);
//! shutdown_telemetry().await;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod telemetry;

pub use config::TelemetryConfiguration;
pub use error::{ConfigError, Result, TelemetryError};
pub use telemetry::{
    get_telemetry, initialize_telemetry, shutdown_telemetry, HealthcareContext, PhiDataLevel,
    Span, SpanKind, SpanStatus, TelemetrySystem, TraceContext,
};

/// Medtrace version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
