// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Distributed tracing and performance profiling.
//!
//! - **Spans**: timed records with attributes, events, links and optional
//!   healthcare annotations
//! - **Context**: trace and span ids propagated parent to child, per task
//! - **Profiling**: CPU, memory and workload deltas folded into each span
//! - **Export**: batched delivery of finished spans in Jaeger JSON form
//!
//! # Usage
//!
//! ```rust,ignore
//! use medtrace::telemetry::{initialize_telemetry, SpanKind};
//! use medtrace::config::TelemetryConfiguration;
//!
//! let telemetry = initialize_telemetry(TelemetryConfiguration::for_service("orders"));
//!
//! let order = telemetry
//!     .with_telemetry("place_order", SpanKind::Server, |span| async move {
//!         span.set_attribute("order.items", 3);
//!         place_order().await
//!     })
//!     .await?;
//!
//! telemetry.shutdown().await;
//! ```
//!
//! # Patient data
//!
//! Spans touching protected health information should be started through
//! [`TelemetrySystem::trace_phi_data_access`] or
//! [`TelemetrySystem::trace_clinical_workflow`] so they carry the compliance
//! flags and audit record reviewers look for.

pub mod clock;
pub mod context;
pub mod export;
mod global;
mod instrument;
pub mod jaeger;
pub mod profiler;
pub mod span;
pub mod stats;
mod system;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use context::{with_context, SpanId, TraceContext, TraceFlags, TraceId};
pub use export::{JaegerHttpExporter, LogExporter, MemoryExporter, SpanExporter};
pub use global::{get_telemetry, initialize_telemetry, shutdown_telemetry};
pub use jaeger::{JaegerBatch, JaegerLog, JaegerProcess, JaegerSpan, JaegerTag, TagType};
pub use profiler::{
    AiOperationStats, DatabaseQueryStats, GcHook, GcStats, NullResourceReader, PerformanceProfile,
    PerformanceProfiler, ProcResourceReader, ResourceReader, ResourceSample,
};
pub use span::{
    AttributeValue, Attributes, HealthcareContext, PhiDataLevel, Span, SpanData, SpanEvent,
    SpanKind, SpanLink, SpanStatus, StatusCode,
};
pub use stats::{Histogram, TelemetryStats, TelemetryStatsSnapshot};
pub use system::{
    should_sample, TelemetrySystem, AUDIT_TARGET, CLINICAL_WORKFLOW_FLAGS, PHI_ACCESS_FLAGS,
};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
