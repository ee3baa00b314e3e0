// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-operation resource profiling.
//!
//! The profiler snapshots process counters when an operation starts and
//! returns the difference when it ends. Database, AI and GC counters are
//! process-wide: two operations profiled at the same time both see all the
//! activity that happened during their windows.
//!
//! On Linux, CPU and memory come from `/proc/self`:
//!
//! ```text
//! /proc/self/stat    utime (field 14) + stime (field 15), in clock ticks
//! /proc/self/statm   size resident shared text lib data dt, in pages
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::lock;
use super::span::AttributeValue;

/// Clock ticks per second assumed for `/proc` CPU times (USER_HZ).
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

const PAGE_SIZE: u64 = 4096;

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcStats {
    pub collections: u64,
    /// Milliseconds
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseQueryStats {
    pub count: u64,
    /// Milliseconds
    pub total_duration: f64,
    /// Milliseconds; a high-water mark
    pub slowest_query: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiOperationStats {
    /// Milliseconds
    pub inference_time: f64,
    /// Milliseconds
    pub model_load_time: f64,
    pub tokens_processed: u64,
}

/// A snapshot, or the difference between two snapshots, of process counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceProfile {
    /// CPU time in milliseconds
    pub cpu_usage: f64,
    /// Resident set size in bytes
    pub memory_usage: i64,
    pub heap_used: i64,
    pub heap_total: i64,
    /// Milliseconds
    pub event_loop_lag: f64,
    pub gc_stats: GcStats,
    pub database_queries: DatabaseQueryStats,
    pub ai_operations: AiOperationStats,
}

impl PerformanceProfile {
    /// Field-wise `end - start`.
    ///
    /// `heap_total` keeps the end value and `slowest_query` the maximum: both
    /// are point-in-time readings, not cumulative counters.
    pub fn delta(start: &PerformanceProfile, end: &PerformanceProfile) -> PerformanceProfile {
        PerformanceProfile {
            cpu_usage: end.cpu_usage - start.cpu_usage,
            memory_usage: end.memory_usage - start.memory_usage,
            heap_used: end.heap_used - start.heap_used,
            heap_total: end.heap_total,
            event_loop_lag: end.event_loop_lag - start.event_loop_lag,
            gc_stats: GcStats {
                collections: end
                    .gc_stats
                    .collections
                    .saturating_sub(start.gc_stats.collections),
                duration: end.gc_stats.duration - start.gc_stats.duration,
            },
            database_queries: DatabaseQueryStats {
                count: end
                    .database_queries
                    .count
                    .saturating_sub(start.database_queries.count),
                total_duration: end.database_queries.total_duration
                    - start.database_queries.total_duration,
                slowest_query: end
                    .database_queries
                    .slowest_query
                    .max(start.database_queries.slowest_query),
            },
            ai_operations: AiOperationStats {
                inference_time: end.ai_operations.inference_time
                    - start.ai_operations.inference_time,
                model_load_time: end.ai_operations.model_load_time
                    - start.ai_operations.model_load_time,
                tokens_processed: end
                    .ai_operations
                    .tokens_processed
                    .saturating_sub(start.ai_operations.tokens_processed),
            },
        }
    }

    fn clear_resources(&mut self) {
        self.cpu_usage = 0.0;
        self.memory_usage = 0;
        self.heap_used = 0;
        self.heap_total = 0;
    }

    /// Span attributes under the `performance.*` names.
    pub fn to_attributes(&self) -> Vec<(String, AttributeValue)> {
        vec![
            ("performance.cpu_usage_ms".to_string(), self.cpu_usage.into()),
            ("performance.memory_delta".to_string(), self.memory_usage.into()),
            ("performance.heap_used_delta".to_string(), self.heap_used.into()),
            ("performance.heap_total".to_string(), self.heap_total.into()),
            ("performance.event_loop_lag_ms".to_string(), self.event_loop_lag.into()),
            ("performance.gc_collections".to_string(), self.gc_stats.collections.into()),
            ("performance.gc_duration_ms".to_string(), self.gc_stats.duration.into()),
            ("performance.db_queries".to_string(), self.database_queries.count.into()),
            (
                "performance.db_total_duration_ms".to_string(),
                self.database_queries.total_duration.into(),
            ),
            (
                "performance.db_slowest_query_ms".to_string(),
                self.database_queries.slowest_query.into(),
            ),
            (
                "performance.ai_inference_time_ms".to_string(),
                self.ai_operations.inference_time.into(),
            ),
            (
                "performance.ai_model_load_time_ms".to_string(),
                self.ai_operations.model_load_time.into(),
            ),
            (
                "performance.ai_tokens_processed".to_string(),
                self.ai_operations.tokens_processed.into(),
            ),
        ]
    }
}

/// Raw process resource readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_time_ms: f64,
    pub rss_bytes: u64,
    pub heap_used_bytes: u64,
    pub heap_total_bytes: u64,
}

/// Source of process resource readings.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceReader: Send + Sync {
    /// Read current counters, or `None` when unavailable.
    fn read(&self) -> Option<ResourceSample>;
}

/// Reads CPU and memory counters from `/proc/self`.
pub struct ProcResourceReader {
    stat_path: PathBuf,
    statm_path: PathBuf,
}

impl ProcResourceReader {
    pub fn new() -> Self {
        Self::with_paths("/proc/self/stat", "/proc/self/statm")
    }

    pub fn with_paths(stat_path: impl Into<PathBuf>, statm_path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: stat_path.into(),
            statm_path: statm_path.into(),
        }
    }
}

impl Default for ProcResourceReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceReader for ProcResourceReader {
    fn read(&self) -> Option<ResourceSample> {
        let stat = fs::read_to_string(&self.stat_path)
            .map_err(|e| trace!("Could not read {}: {}", self.stat_path.display(), e))
            .ok()?;
        let statm = fs::read_to_string(&self.statm_path)
            .map_err(|e| trace!("Could not read {}: {}", self.statm_path.display(), e))
            .ok()?;

        let cpu_time_ms = parse_stat_cpu_ms(&stat)?;
        let memory = parse_statm(&statm)?;

        Some(ResourceSample {
            cpu_time_ms,
            rss_bytes: memory.resident_pages * PAGE_SIZE,
            heap_used_bytes: memory.data_pages * PAGE_SIZE,
            heap_total_bytes: memory.size_pages * PAGE_SIZE,
        })
    }
}

/// Reader for platforms without `/proc`; always reports nothing.
pub struct NullResourceReader;

impl ResourceReader for NullResourceReader {
    fn read(&self) -> Option<ResourceSample> {
        None
    }
}

/// The reader appropriate for this platform.
pub fn default_reader() -> Arc<dyn ResourceReader> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcResourceReader::new())
    } else {
        Arc::new(NullResourceReader)
    }
}

/// User + system CPU time in milliseconds from a `/proc/<pid>/stat` line.
pub fn parse_stat_cpu_ms(content: &str) -> Option<f64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); utime is field 14, stime field 15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / CLOCK_TICKS_PER_SEC * 1000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatmPages {
    pub size_pages: u64,
    pub resident_pages: u64,
    pub data_pages: u64,
}

/// Parse `/proc/<pid>/statm`.
pub fn parse_statm(content: &str) -> Option<StatmPages> {
    let fields: Vec<u64> = content
        .split_whitespace()
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    Some(StatmPages {
        size_pages: *fields.first()?,
        resident_pages: *fields.get(1)?,
        data_pages: *fields.get(5)?,
    })
}

/// Explicit garbage-collection notification handle.
///
/// Runtimes with a collector (embedded interpreters, arenas with compaction)
/// report each collection through this. Only one hook exists per profiler.
#[derive(Clone)]
pub struct GcHook {
    stats: Arc<Mutex<GcStats>>,
}

impl GcHook {
    pub fn record(&self, duration: Duration) {
        let mut stats = lock(&self.stats);
        stats.collections += 1;
        stats.duration += millis(duration);
    }
}

struct Snapshot {
    profile: PerformanceProfile,
    /// Whether the resource reader produced a reading
    resources: bool,
}

/// Snapshots process counters per operation and computes deltas.
pub struct PerformanceProfiler {
    reader: Arc<dyn ResourceReader>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    query_stats: Mutex<DatabaseQueryStats>,
    ai_stats: Mutex<AiOperationStats>,
    gc_stats: Arc<Mutex<GcStats>>,
    gc_hook_installed: AtomicBool,
    /// f64 milliseconds stored as bits
    event_loop_lag: AtomicU64,
}

impl PerformanceProfiler {
    pub fn new(reader: Arc<dyn ResourceReader>) -> Self {
        Self {
            reader,
            snapshots: Mutex::new(HashMap::new()),
            query_stats: Mutex::new(DatabaseQueryStats::default()),
            ai_stats: Mutex::new(AiOperationStats::default()),
            gc_stats: Arc::new(Mutex::new(GcStats::default())),
            gc_hook_installed: AtomicBool::new(false),
            event_loop_lag: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Read current process counters. Unreadable resources report zero.
    pub fn snapshot(&self) -> PerformanceProfile {
        self.take_snapshot().profile
    }

    fn take_snapshot(&self) -> Snapshot {
        let sample = self.reader.read();
        let resources = sample.is_some();
        let sample = sample.unwrap_or_default();
        let profile = PerformanceProfile {
            cpu_usage: sample.cpu_time_ms,
            memory_usage: sample.rss_bytes as i64,
            heap_used: sample.heap_used_bytes as i64,
            heap_total: sample.heap_total_bytes as i64,
            event_loop_lag: f64::from_bits(self.event_loop_lag.load(Ordering::Relaxed)),
            gc_stats: *lock(&self.gc_stats),
            database_queries: *lock(&self.query_stats),
            ai_operations: *lock(&self.ai_stats),
        };
        Snapshot { profile, resources }
    }

    /// Snapshot counters for `operation_id`.
    ///
    /// Starting the same id twice replaces the earlier snapshot; nested
    /// profiling needs distinct ids.
    pub fn start_profiling(&self, operation_id: &str) {
        let snapshot = self.take_snapshot();
        let previous = lock(&self.snapshots).insert(operation_id.to_string(), snapshot);
        if previous.is_some() {
            debug!(operation_id, "Replacing existing profiling snapshot");
        }
    }

    /// Delta since `start_profiling`, consuming the snapshot.
    ///
    /// CPU and memory fields are zero unless both ends of the window read
    /// the process resources.
    pub fn end_profiling(&self, operation_id: &str) -> Option<PerformanceProfile> {
        let start = lock(&self.snapshots).remove(operation_id);
        match start {
            Some(start) => {
                let end = self.take_snapshot();
                let mut delta = PerformanceProfile::delta(&start.profile, &end.profile);
                if !(start.resources && end.resources) {
                    debug!(operation_id, "Resource reading missing; omitting CPU and memory delta");
                    delta.clear_resources();
                }
                Some(delta)
            }
            None => {
                debug!(operation_id, "No profiling snapshot to end");
                None
            }
        }
    }

    /// Number of operations currently being profiled.
    pub fn active_profiles(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn record_database_query(&self, duration: Duration) {
        let ms = millis(duration);
        let mut stats = lock(&self.query_stats);
        stats.count += 1;
        stats.total_duration += ms;
        stats.slowest_query = stats.slowest_query.max(ms);
    }

    pub fn record_ai_operation(
        &self,
        inference_time: Duration,
        model_load_time: Option<Duration>,
        tokens_processed: Option<u64>,
    ) {
        let mut stats = lock(&self.ai_stats);
        stats.inference_time += millis(inference_time);
        if let Some(load) = model_load_time {
            stats.model_load_time += millis(load);
        }
        if let Some(tokens) = tokens_processed {
            stats.tokens_processed += tokens;
        }
    }

    pub fn record_event_loop_lag(&self, lag: Duration) {
        self.event_loop_lag
            .store(millis(lag).to_bits(), Ordering::Relaxed);
    }

    /// Hand out the GC notification hook. Returns `None` once it has been taken.
    pub fn install_gc_hook(&self) -> Option<GcHook> {
        self.gc_hook_installed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GcHook {
                stats: Arc::clone(&self.gc_stats),
            })
    }

    /// Measure scheduler lag by how late a periodic sleep wakes up.
    ///
    /// The task stops once the profiler is dropped. Requires a tokio runtime.
    pub fn spawn_lag_probe(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let profiler: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let start = Instant::now();
                tokio::time::sleep(interval).await;
                let lag = start.elapsed().saturating_sub(interval);
                match profiler.upgrade() {
                    Some(profiler) => profiler.record_event_loop_lag(lag),
                    None => break,
                }
            }
        })
    }
}

impl Default for PerformanceProfiler {
    fn default() -> Self {
        Self::new(default_reader())
    }
}
