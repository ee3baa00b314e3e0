// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The telemetry system: span lifecycle, sampling, buffering and export.
//!
//! Span states:
//!
//! ```text
//! start_span ──▶ active ──finish_span──▶ completed buffer ──▶ exported
//!     │                                        │
//!     └─ not sampled (never tracked)           └─▶ evicted (buffer full, oldest first)
//! ```
//!
//! Nothing here returns an error to the caller. Export failures, missing
//! profiler snapshots and the like are logged and dropped.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TelemetryConfiguration;
use crate::error::TelemetryError;

use super::clock;
use super::context::{self, SpanId, TraceContext};
use super::export::{JaegerHttpExporter, LogExporter, SpanExporter};
use super::jaeger::JaegerBatch;
use super::lock;
use super::profiler::PerformanceProfiler;
use super::span::{HealthcareContext, PhiDataLevel, Span, SpanData, SpanKind, SpanStatus};
use super::stats::{TelemetryStats, TelemetryStatsSnapshot};

/// Log target for healthcare audit records.
pub const AUDIT_TARGET: &str = "medtrace::audit";

/// Compliance flags forced onto PHI access spans.
pub const PHI_ACCESS_FLAGS: &[&str] = &["HIPAA", "PHI_ACCESS"];

/// Compliance flags forced onto clinical workflow spans.
pub const CLINICAL_WORKFLOW_FLAGS: &[&str] = &["HIPAA", "CLINICAL_WORKFLOW"];

const LAG_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Probabilistic sampling decision.
pub fn should_sample(rate: f64) -> bool {
    if rate >= 1.0 {
        true
    } else if rate > 0.0 {
        rand::random::<f64>() < rate
    } else {
        // Also covers NaN.
        false
    }
}

struct BackgroundTasks {
    export: JoinHandle<()>,
    lag_probe: Option<JoinHandle<()>>,
    stop: Arc<Notify>,
}

struct Inner {
    config: Arc<TelemetryConfiguration>,
    profiler: Arc<PerformanceProfiler>,
    exporter: Arc<dyn SpanExporter>,
    active: Mutex<HashMap<SpanId, Span>>,
    completed: Mutex<VecDeque<SpanData>>,
    current: Mutex<Option<TraceContext>>,
    stats: TelemetryStats,
    tasks: Mutex<Option<BackgroundTasks>>,
    shut_down: AtomicBool,
}

/// Handle to a telemetry system. Clones share the same state.
#[derive(Clone)]
pub struct TelemetrySystem {
    inner: Arc<Inner>,
}

impl TelemetrySystem {
    /// Build a system with the platform profiler and the configured sink.
    ///
    /// Production deployments with a Jaeger endpoint export over HTTP; all
    /// others log a summary of each batch.
    pub fn new(config: TelemetryConfiguration) -> Self {
        let exporter = default_exporter(&config);
        Self::with_components(config, Arc::new(PerformanceProfiler::default()), exporter)
    }

    /// Build a system that exports to `exporter`.
    pub fn with_exporter(config: TelemetryConfiguration, exporter: Arc<dyn SpanExporter>) -> Self {
        Self::with_components(config, Arc::new(PerformanceProfiler::default()), exporter)
    }

    pub fn with_components(
        config: TelemetryConfiguration,
        profiler: Arc<PerformanceProfiler>,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        debug!(
            service = %config.service_name,
            environment = %config.environment,
            sink = exporter.name(),
            "Telemetry system created"
        );
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                profiler,
                exporter,
                active: Mutex::new(HashMap::new()),
                completed: Mutex::new(VecDeque::new()),
                current: Mutex::new(None),
                stats: TelemetryStats::new(),
                tasks: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TelemetryConfiguration {
        &self.inner.config
    }

    pub fn profiler(&self) -> &Arc<PerformanceProfiler> {
        &self.inner.profiler
    }

    pub fn exporter_name(&self) -> &str {
        self.inner.exporter.name()
    }

    /// Child of `parent`, or a fresh root.
    pub fn create_trace_context(&self, parent: Option<&TraceContext>) -> TraceContext {
        TraceContext::derive(parent)
    }

    /// Set the current context.
    ///
    /// Inside a scope ([`TelemetrySystem::scope`], `with_telemetry`) this
    /// only affects the scope. Outside one it sets the process-wide fallback,
    /// which concurrent requests share.
    pub fn set_current_context(&self, ctx: Option<TraceContext>) {
        if context::task_context().is_some() {
            context::set_task_context(ctx);
        } else {
            *lock(&self.inner.current) = ctx;
        }
    }

    /// The enclosing scope's context, or the fallback slot outside a scope.
    pub fn get_current_context(&self) -> Option<TraceContext> {
        match context::task_context() {
            Some(scoped) => scoped,
            None => lock(&self.inner.current).clone(),
        }
    }

    /// Run `future` with `ctx` as its task-local current context.
    pub async fn scope<F>(&self, ctx: TraceContext, future: F) -> F::Output
    where
        F: Future,
    {
        context::with_context(ctx, future).await
    }

    /// Start an internal span parented on the current context.
    pub fn span(&self, name: &str) -> Span {
        self.start_span(name, SpanKind::Internal, None, None)
    }

    /// Start a span.
    ///
    /// The parent is `parent` if given, else the current context, else none
    /// (a new trace). Unsampled spans are returned untracked: they accept
    /// mutations but are never profiled or exported.
    pub fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        healthcare_context: Option<HealthcareContext>,
        parent: Option<&TraceContext>,
    ) -> Span {
        let parent = match parent {
            Some(parent) => Some(parent.clone()),
            None => self.get_current_context(),
        };
        let ctx = self.create_trace_context(parent.as_ref());
        let mut data = SpanData::new(name, ctx.clone(), kind, healthcare_context);

        let sampled = should_sample(self.inner.config.sampling_rate);
        self.inner.stats.span_started(sampled);
        if !sampled {
            return Span::from_data(data, false);
        }

        let config = &self.inner.config;
        data.set_attributes([
            ("service.name", config.service_name.as_str()),
            ("service.version", config.service_version.as_str()),
            ("deployment.environment", config.environment.as_str()),
        ]);
        data.set_attributes(
            config
                .custom_attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let span = Span::from_data(data, true);
        lock(&self.inner.active).insert(ctx.span_id, span.clone());
        self.set_current_context(Some(ctx.clone()));

        if config.enable_performance_profiling {
            self.inner.profiler.start_profiling(&ctx.span_id.to_string());
        }

        span
    }

    /// End a span and move it to the completed buffer.
    ///
    /// Folds the profiler delta into `performance.*` attributes and evicts the
    /// oldest buffered spans past capacity. Finishing twice is a no-op.
    pub fn finish_span(&self, span: &Span) {
        if !span.is_recording() {
            span.end();
            return;
        }

        let span_id = span.span_id();
        if lock(&self.inner.active).remove(&span_id).is_none() {
            debug!(span_id = %span_id, "Span already finished");
            return;
        }

        span.end();

        if self.inner.config.enable_performance_profiling {
            if let Some(delta) = self.inner.profiler.end_profiling(&span_id.to_string()) {
                span.merge_attributes(delta.to_attributes());
            }
        }

        let evicted = {
            let mut completed = lock(&self.inner.completed);
            completed.push_back(span.snapshot());
            let mut evicted = 0u64;
            while completed.len() > self.inner.config.max_spans_per_trace {
                completed.pop_front();
                evicted += 1;
            }
            evicted
        };

        self.inner.stats.span_finished();
        if evicted > 0 {
            self.inner.stats.spans_evicted(evicted);
            debug!(evicted, "Completed span buffer full; dropped oldest spans");
        }
    }

    pub fn active_span_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    pub fn completed_span_count(&self) -> usize {
        lock(&self.inner.completed).len()
    }

    /// Copies of the buffered, not yet exported spans (oldest first).
    pub fn completed_spans(&self) -> Vec<SpanData> {
        lock(&self.inner.completed).iter().cloned().collect()
    }

    /// Force-finish active spans older than `max_age` with an error status.
    ///
    /// Returns how many spans were swept.
    pub fn sweep_abandoned(&self, max_age: Duration) -> usize {
        let now = clock::now_micros();
        let max_age_micros = max_age.as_micros() as u64;

        let stale: Vec<Span> = lock(&self.inner.active)
            .values()
            .filter(|span| now.saturating_sub(span.start_time()) > max_age_micros)
            .cloned()
            .collect();

        for span in &stale {
            warn!(span_id = %span.span_id(), name = %span.name(), "Finishing abandoned span");
            span.set_status(SpanStatus::error("span abandoned"));
            self.finish_span(span);
            self.inner.stats.span_abandoned();
        }

        stale.len()
    }

    /// Send every buffered span to the sink once.
    ///
    /// The buffer is emptied whether or not delivery succeeds. Returns the
    /// number of spans handed to the sink.
    pub async fn export_traces(&self) -> usize {
        let spans: Vec<SpanData> = lock(&self.inner.completed).drain(..).collect();
        if spans.is_empty() {
            return 0;
        }

        let service_name = &self.inner.config.service_name;
        let batch = JaegerBatch::new(
            spans
                .iter()
                .map(|span| span.to_jaeger_format(service_name))
                .collect(),
        );
        let count = batch.len();

        let exporter = &self.inner.exporter;
        let start = Instant::now();
        let result = match tokio::time::timeout(
            self.inner.config.export_timeout(),
            exporter.export(&batch),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::export(exporter.name(), "timed out")),
        };

        let elapsed = start.elapsed();
        self.inner
            .stats
            .export_attempted(count as u64, elapsed, result.is_ok());

        match result {
            Ok(()) => debug!(spans = count, sink = exporter.name(), "Exported spans"),
            Err(e) => error!(
                spans = count,
                sink = exporter.name(),
                retryable = e.is_retryable(),
                "Failed to export traces: {}",
                e
            ),
        }

        count
    }

    async fn run_export_cycle(&self) {
        if let Some(max_age) = self.inner.config.abandoned_span_timeout() {
            self.sweep_abandoned(max_age);
        }
        self.export_traces().await;
    }

    /// Spawn the periodic export task (and the scheduler lag probe when
    /// profiling is enabled).
    ///
    /// Returns `false` without a tokio runtime, with a zero interval, after
    /// shutdown, or when already running.
    pub fn start_export_loop(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }

        let period = self.inner.config.export_interval();
        if period.is_zero() {
            warn!("Export interval is zero; periodic export disabled");
            return false;
        }

        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime; periodic export disabled");
            return false;
        }

        let mut tasks = lock(&self.inner.tasks);
        if tasks.is_some() {
            return false;
        }

        let stop = Arc::new(Notify::new());
        let weak = Arc::downgrade(&self.inner);
        let stop_signal = Arc::clone(&stop);

        let export = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_signal.notified() => break,
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                TelemetrySystem { inner }.run_export_cycle().await;
            }
            debug!("Export loop stopped");
        });

        let lag_probe = self
            .inner
            .config
            .enable_performance_profiling
            .then(|| self.inner.profiler.spawn_lag_probe(LAG_PROBE_INTERVAL));

        *tasks = Some(BackgroundTasks {
            export,
            lag_probe,
            stop,
        });

        debug!(interval_ms = period.as_millis() as u64, "Export loop started");
        true
    }

    pub fn is_export_loop_running(&self) -> bool {
        lock(&self.inner.tasks).is_some()
    }

    fn stop_background_tasks(&self) {
        if let Some(tasks) = lock(&self.inner.tasks).take() {
            tasks.stop.notify_one();
            if let Some(probe) = tasks.lag_probe {
                probe.abort();
            }
            drop(tasks.export);
        }
    }

    /// Finish every active span, stop the export loop and export once more.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let active: Vec<Span> = lock(&self.inner.active).values().cloned().collect();
        for span in &active {
            self.finish_span(span);
        }

        self.stop_background_tasks();
        let exported = self.export_traces().await;

        info!(
            forced = active.len(),
            exported,
            service = %self.inner.config.service_name,
            "Telemetry shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn detach(&self) {
        self.stop_background_tasks();
    }

    pub fn record_database_query(&self, duration: Duration) {
        self.inner.profiler.record_database_query(duration);
    }

    pub fn record_ai_operation(
        &self,
        inference_time: Duration,
        model_load_time: Option<Duration>,
        tokens_processed: Option<u64>,
    ) {
        self.inner
            .profiler
            .record_ai_operation(inference_time, model_load_time, tokens_processed);
    }

    pub fn stats(&self) -> TelemetryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Start a span auditing access to a patient's protected data.
    ///
    /// Always treated as full PHI sensitivity.
    pub fn trace_phi_data_access(
        &self,
        operation: &str,
        patient_id: &str,
        data_type: &str,
        access_reason: &str,
    ) -> Span {
        let hc = PHI_ACCESS_FLAGS.iter().fold(
            HealthcareContext::new(PhiDataLevel::Full).with_patient(patient_id),
            |hc, flag| hc.with_flag(*flag),
        );

        let span = self.start_span(&format!("phi.{operation}"), SpanKind::Internal, Some(hc), None);
        span.record_phi_access(data_type, access_reason, None);

        if self.inner.config.enable_healthcare_audit {
            info!(
                target: AUDIT_TARGET,
                trace_id = %span.trace_id(),
                span_id = %span.span_id(),
                patient_id,
                data_type,
                access_reason,
                "PHI access"
            );
        }

        span
    }

    /// Start a span for one step of a clinical workflow.
    ///
    /// Always treated as full PHI sensitivity.
    pub fn trace_clinical_workflow(
        &self,
        workflow_id: &str,
        step: &str,
        patient_id: Option<&str>,
        encounter_id: Option<&str>,
    ) -> Span {
        let mut hc = CLINICAL_WORKFLOW_FLAGS.iter().fold(
            HealthcareContext::new(PhiDataLevel::Full).with_workflow(workflow_id),
            |hc, flag| hc.with_flag(*flag),
        );
        if let Some(patient) = patient_id {
            hc = hc.with_patient(patient);
        }
        if let Some(encounter) = encounter_id {
            hc = hc.with_encounter(encounter);
        }

        let span = self.start_span(&format!("clinical.{step}"), SpanKind::Internal, Some(hc), None);
        span.set_attributes([("clinical.workflow_id", workflow_id), ("clinical.step", step)]);

        if self.inner.config.enable_healthcare_audit {
            info!(
                target: AUDIT_TARGET,
                trace_id = %span.trace_id(),
                span_id = %span.span_id(),
                workflow_id,
                step,
                patient_id = patient_id.unwrap_or("-"),
                "Clinical workflow step"
            );
        }

        span
    }
}

impl std::fmt::Debug for TelemetrySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySystem")
            .field("service", &self.inner.config.service_name)
            .field("sink", &self.inner.exporter.name())
            .field("active", &self.active_span_count())
            .field("completed", &self.completed_span_count())
            .finish()
    }
}

fn default_exporter(config: &TelemetryConfiguration) -> Arc<dyn SpanExporter> {
    match (&config.jaeger_endpoint, config.is_production()) {
        (Some(endpoint), true) => match JaegerHttpExporter::new(endpoint, config.export_timeout()) {
            Ok(exporter) => Arc::new(exporter),
            Err(e) => {
                warn!("Could not build Jaeger exporter, falling back to log: {}", e);
                Arc::new(LogExporter)
            }
        },
        _ => Arc::new(LogExporter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::export::MemoryExporter;
    use crate::telemetry::profiler::NullResourceReader;
    use crate::telemetry::span::AttributeValue;

    fn system(config: TelemetryConfiguration) -> (TelemetrySystem, Arc<MemoryExporter>) {
        let exporter = Arc::new(MemoryExporter::new());
        let system = TelemetrySystem::with_components(
            config,
            Arc::new(PerformanceProfiler::new(Arc::new(NullResourceReader))),
            exporter.clone(),
        );
        (system, exporter)
    }

    fn always_sampled() -> TelemetryConfiguration {
        TelemetryConfiguration::for_service("test-service").with_sampling_rate(1.0)
    }

    #[test]
    fn test_should_sample_bounds() {
        assert!(should_sample(1.0));
        assert!(should_sample(7.0));
        assert!(!should_sample(0.0));
        assert!(!should_sample(-1.0));
        assert!(!should_sample(f64::NAN));
    }

    #[test]
    fn test_default_exporter_selection() {
        let dev = TelemetrySystem::new(
            TelemetryConfiguration::default().with_jaeger_endpoint("http://jaeger:14268"),
        );
        assert_eq!(dev.exporter_name(), "log");

        let prod = TelemetrySystem::new(
            TelemetryConfiguration::default()
                .with_environment("production")
                .with_jaeger_endpoint("http://jaeger:14268"),
        );
        assert_eq!(prod.exporter_name(), "jaeger");
    }

    #[test]
    fn test_start_span_registers_active() {
        let (system, _) = system(always_sampled());
        let span = system.span("lookup");

        assert!(span.is_recording());
        assert_eq!(system.active_span_count(), 1);
        assert_eq!(system.get_current_context().unwrap().span_id, span.span_id());
        assert_eq!(
            span.attribute("service.name"),
            Some(AttributeValue::from("test-service"))
        );
        assert_eq!(system.profiler().active_profiles(), 1);
    }

    #[test]
    fn test_custom_attributes_applied() {
        let config = always_sampled().with_custom_attribute("team", "clinical");
        let (system, _) = system(config);
        let span = system.span("op");
        assert_eq!(span.attribute("team"), Some(AttributeValue::from("clinical")));
    }

    #[test]
    fn test_unsampled_span_is_untracked() {
        let (system, _) = system(always_sampled().with_sampling_rate(0.0));
        let span = system.span("op");
        span.set_attribute("still", "accepted");

        assert!(!span.is_recording());
        assert_eq!(system.active_span_count(), 0);
        assert!(system.get_current_context().is_none());
        assert_eq!(system.profiler().active_profiles(), 0);

        system.finish_span(&span);
        assert!(span.is_ended());
        assert_eq!(system.completed_span_count(), 0);
        assert_eq!(span.attribute("still"), Some(AttributeValue::from("accepted")));
    }

    #[test]
    fn test_unsampled_span_still_propagates_context() {
        let (system, _) = system(always_sampled().with_sampling_rate(0.0));
        let parent = system.span("parent");
        let child = system.start_span("child", SpanKind::Internal, None, Some(parent.context()));
        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.context().parent_span_id, Some(parent.span_id()));
    }

    #[test]
    fn test_child_inherits_current_context() {
        let (system, _) = system(always_sampled());
        let root = system.span("root");
        let child = system.span("child");

        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.context().parent_span_id, Some(root.span_id()));
    }

    #[test]
    fn test_explicit_parent_wins_over_current() {
        let (system, _) = system(always_sampled());
        let a = system.span("a");
        let _b = system.span("unrelated");
        system.set_current_context(None);
        let _c = system.span("new-root");

        let child = system.start_span("child", SpanKind::Client, None, Some(a.context()));
        assert_eq!(child.context().parent_span_id, Some(a.span_id()));
    }

    #[test]
    fn test_finish_moves_to_completed_with_performance() {
        let (system, _) = system(always_sampled());
        let span = system.span("op");
        system.record_database_query(Duration::from_millis(12));
        system.finish_span(&span);

        assert_eq!(system.active_span_count(), 0);
        let completed = system.completed_spans();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].is_ended());
        assert_eq!(
            completed[0].attribute("performance.db_queries"),
            Some(&AttributeValue::Int(1))
        );
        assert_eq!(system.profiler().active_profiles(), 0);
    }

    #[test]
    fn test_profiling_disabled_adds_no_attributes() {
        let (system, _) = system(always_sampled().with_profiling(false));
        let span = system.span("op");
        system.finish_span(&span);
        assert!(system.completed_spans()[0]
            .attribute("performance.cpu_usage_ms")
            .is_none());
    }

    #[test]
    fn test_finish_twice_is_noop() {
        let (system, _) = system(always_sampled());
        let span = system.span("op");
        system.finish_span(&span);
        system.finish_span(&span);
        assert_eq!(system.completed_span_count(), 1);
    }

    #[test]
    fn test_buffer_evicts_oldest_first() {
        let (system, _) = system(always_sampled().with_max_spans(3));
        for i in 0..4 {
            let span = system.start_span(&format!("op-{i}"), SpanKind::Internal, None, None);
            system.finish_span(&span);
        }

        let names: Vec<_> = system
            .completed_spans()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["op-1", "op-2", "op-3"]);
        assert_eq!(system.stats().spans_evicted, 1);
    }

    #[test]
    fn test_sweep_abandoned() {
        let (system, _) = system(always_sampled());
        let stale = system.span("forgotten");
        std::thread::sleep(Duration::from_millis(5));
        let fresh = system.span("fresh");

        let swept = system.sweep_abandoned(Duration::from_millis(3));
        assert_eq!(swept, 1);
        assert!(stale.is_ended());
        assert_eq!(stale.status(), SpanStatus::error("span abandoned"));
        assert!(!fresh.is_ended());
        assert_eq!(system.active_span_count(), 1);
        assert_eq!(system.stats().spans_abandoned, 1);
    }

    #[tokio::test]
    async fn test_export_empty_buffer_is_noop() {
        let (system, exporter) = system(always_sampled());
        assert_eq!(system.export_traces().await, 0);
        assert_eq!(exporter.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_export_drains_buffer() {
        let (system, exporter) = system(always_sampled());
        for _ in 0..3 {
            let span = system.span("op");
            system.finish_span(&span);
            system.set_current_context(None);
        }

        assert_eq!(system.export_traces().await, 3);
        assert_eq!(system.completed_span_count(), 0);
        assert_eq!(exporter.spans().len(), 3);
        assert_eq!(exporter.spans()[0].process.service_name, "test-service");
        assert_eq!(system.stats().spans_exported, 3);
    }

    struct FailingExporter;

    #[async_trait::async_trait]
    impl SpanExporter for FailingExporter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn export(&self, _batch: &JaegerBatch) -> Result<(), TelemetryError> {
            Err(TelemetryError::ExportStatus {
                status: 503,
                body: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_export_drops_spans() {
        let system = TelemetrySystem::with_exporter(always_sampled(), Arc::new(FailingExporter));
        let span = system.span("op");
        system.finish_span(&span);

        assert_eq!(system.export_traces().await, 1);
        assert_eq!(system.completed_span_count(), 0);
        let stats = system.stats();
        assert_eq!(stats.export_failures, 1);
        assert_eq!(stats.spans_exported, 0);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_active_and_exports() {
        let (system, exporter) = system(always_sampled());
        let _open = system.span("in-flight");
        let done = system.span("done");
        system.finish_span(&done);

        system.shutdown().await;
        assert!(system.is_shut_down());
        assert_eq!(system.active_span_count(), 0);
        assert_eq!(exporter.spans().len(), 2);

        // Second shutdown does nothing.
        system.shutdown().await;
        assert_eq!(exporter.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_export_loop_flushes_periodically() {
        let config = always_sampled().with_export_interval(Duration::from_millis(20));
        let (system, exporter) = system(config);
        assert!(system.start_export_loop());
        assert!(!system.start_export_loop());

        let span = system.span("op");
        system.finish_span(&span);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(exporter.spans().len(), 1);
        system.shutdown().await;
        assert!(!system.is_export_loop_running());
    }

    #[tokio::test]
    async fn test_export_loop_sweeps_abandoned_spans() {
        let mut config = always_sampled().with_export_interval(Duration::from_millis(30));
        config.abandoned_span_timeout_ms = Some(10);
        let (system, exporter) = system(config);
        assert!(system.start_export_loop());

        let forgotten = system.span("forgotten");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(forgotten.is_ended());
        assert_eq!(system.active_span_count(), 0);
        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].tag("otel.status_description").map(|t| t.value.as_str()),
            Some("span abandoned")
        );
        assert_eq!(system.stats().spans_abandoned, 1);
        system.shutdown().await;
    }

    #[test]
    fn test_start_span_copies_parent_baggage() {
        let (system, _) = system(always_sampled());
        let parent = TraceContext::new_root().with_baggage("tenant", "north");
        let child = system.start_span("child", SpanKind::Internal, None, Some(&parent));

        assert_eq!(child.context().baggage_item("tenant"), Some("north"));

        let mut edited = child.context().clone();
        edited.set_baggage("tenant", "south");
        edited.set_baggage("request", "r-9");
        assert_eq!(parent.baggage_item("tenant"), Some("north"));
        assert_eq!(parent.baggage_item("request"), None);
        assert_eq!(child.context().baggage_item("tenant"), Some("north"));
    }

    #[tokio::test]
    async fn test_set_current_context_inside_scope() {
        let (system, _) = system(always_sampled());
        let outside = TraceContext::new_root();
        system.set_current_context(Some(outside.clone()));

        let replacement = TraceContext::new_root();
        let seen = system
            .scope(TraceContext::new_root(), async {
                system.set_current_context(Some(replacement.clone()));
                let seen = system.get_current_context();
                let span = system.span("scoped");
                (seen, span)
            })
            .await;

        let (seen, span) = seen;
        assert_eq!(seen.map(|c| c.span_id), Some(replacement.span_id));
        assert_eq!(span.context().parent_span_id, Some(replacement.span_id));
        // Spans started inside the scope leave the fallback slot alone.
        assert_eq!(
            system.get_current_context().map(|c| c.span_id),
            Some(outside.span_id)
        );
    }

    #[tokio::test]
    async fn test_sequential_spans_in_scope_chain() {
        let (system, _) = system(always_sampled());
        let root = TraceContext::new_root();
        let (a, b) = system
            .scope(root.clone(), async {
                let a = system.span("a");
                let b = system.span("b");
                (a, b)
            })
            .await;

        assert_eq!(a.context().parent_span_id, Some(root.span_id));
        assert_eq!(b.context().parent_span_id, Some(a.span_id()));
        assert!(system.get_current_context().is_none());
    }

    #[test]
    fn test_export_loop_needs_runtime() {
        let (system, _) = system(always_sampled());
        assert!(!system.start_export_loop());
    }

    #[test]
    fn test_trace_phi_data_access() {
        let (system, _) = system(always_sampled());
        let span = system.trace_phi_data_access("lookup", "p1", "diagnosis", "treatment");

        assert_eq!(span.name(), "phi.lookup");
        assert_eq!(
            span.attribute("healthcare.phi_level"),
            Some(AttributeValue::from("full"))
        );
        assert_eq!(
            span.attribute("healthcare.compliance_flags"),
            Some(AttributeValue::from("HIPAA,PHI_ACCESS"))
        );

        let data = span.snapshot();
        let phi_events: Vec<_> = data.events().iter().filter(|e| e.name == "phi_access").collect();
        assert_eq!(phi_events.len(), 1);
        assert_eq!(
            phi_events[0].attributes.get("phi.data_type"),
            Some(&AttributeValue::from("diagnosis"))
        );
        assert_eq!(
            data.healthcare_context().unwrap().patient_id.as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn test_custom_attributes_cannot_downgrade_phi_spans() {
        let config = always_sampled()
            .with_custom_attribute("healthcare.phi_level", "none")
            .with_custom_attribute("healthcare.compliance_flags", "")
            .with_custom_attribute("team", "records");
        let (system, _) = system(config);

        let span = system.trace_phi_data_access("lookup", "p1", "diagnosis", "treatment");
        assert_eq!(
            span.attribute("healthcare.phi_level"),
            Some(AttributeValue::from("full"))
        );
        assert_eq!(
            span.attribute("healthcare.compliance_flags"),
            Some(AttributeValue::from("HIPAA,PHI_ACCESS"))
        );
        assert_eq!(span.attribute("team"), Some(AttributeValue::from("records")));

        let workflow = system.trace_clinical_workflow("wf-1", "intake", None, None);
        assert_eq!(
            workflow.attribute("healthcare.phi_level"),
            Some(AttributeValue::from("full"))
        );
    }

    #[test]
    fn test_trace_clinical_workflow() {
        let (system, _) = system(always_sampled());
        let span = system.trace_clinical_workflow("wf-9", "triage", Some("p2"), Some("enc-1"));

        assert_eq!(span.name(), "clinical.triage");
        assert_eq!(span.attribute("clinical.workflow_id"), Some(AttributeValue::from("wf-9")));
        assert_eq!(span.attribute("clinical.step"), Some(AttributeValue::from("triage")));
        assert_eq!(
            span.attribute("healthcare.compliance_flags"),
            Some(AttributeValue::from("CLINICAL_WORKFLOW,HIPAA"))
        );

        let hc = span.snapshot().healthcare_context().cloned().unwrap();
        assert_eq!(hc.phi_data_level, PhiDataLevel::Full);
        assert_eq!(hc.encounter_id.as_deref(), Some("enc-1"));
        assert_eq!(hc.clinical_workflow_id.as_deref(), Some("wf-9"));
    }
}
