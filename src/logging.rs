//! Structured logging and run metrics for KMX
//!
//! Sets up the `tracing` subscriber (console or daily rolling files, plain or
//! JSON) and provides a small metrics collector and a progress reporter used
//! by the matrix builder.

use crate::error::{KmxError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};
use uuid::Uuid;

/// Log level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = KmxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(KmxError::config(format!("Invalid log level: {}", s))),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level
    pub level: LogLevel,
    /// Enable structured JSON logging
    pub json_format: bool,
    /// Log file directory (None for stderr only)
    pub log_dir: Option<PathBuf>,
    /// Log file name pattern
    pub log_file_pattern: String,
    /// Module-specific log levels
    pub module_levels: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            log_dir: None,
            log_file_pattern: "kmx.log".to_string(),
            module_levels: HashMap::new(),
        }
    }
}

/// Running aggregate for one timer; individual samples are not kept
#[derive(Debug, Clone, Copy)]
struct TimerAggregate {
    count: usize,
    sum: Duration,
    min: Duration,
    max: Duration,
}

impl TimerAggregate {
    fn new(duration: Duration) -> Self {
        Self {
            count: 1,
            sum: duration,
            min: duration,
            max: duration,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.sum += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }
}

/// Run metrics: counters, gauges, timers and peak memory
#[derive(Debug)]
pub struct MetricsCollector {
    run_id: Uuid,
    counters: RwLock<HashMap<String, AtomicU64>>,
    timers: RwLock<HashMap<String, TimerAggregate>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
    peak_memory: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_run_id(Uuid::new_v4())
    }

    /// Collector whose summary reports under an existing run id
    pub fn with_run_id(run_id: Uuid) -> Self {
        Self {
            run_id,
            counters: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            peak_memory: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn inc_counter(&self, name: &str) {
        self.inc_counter_by(name, 1);
    }

    pub fn inc_counter_by(&self, name: &str, value: u64) {
        let counters = self.counters.read().unwrap();
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
        } else {
            drop(counters);
            let mut counters = self.counters.write().unwrap();
            counters
                .entry(name.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn record_time(&self, name: &str, duration: Duration) {
        let mut timers = self.timers.write().unwrap();
        timers
            .entry(name.to_string())
            .and_modify(|agg| agg.record(duration))
            .or_insert_with(|| TimerAggregate::new(duration));
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        let mut gauges = self.gauges.write().unwrap();
        gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Track the highest memory figure seen
    pub fn update_peak_memory(&self, usage: u64) {
        self.peak_memory.fetch_max(usage, Ordering::Relaxed);
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .unwrap()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn get_timing_stats(&self, name: &str) -> Option<TimingStats> {
        let timers = self.timers.read().unwrap();
        timers.get(name).map(|agg| TimingStats {
            count: agg.count,
            sum: agg.sum,
            mean: agg.sum / agg.count as u32,
            min: agg.min,
            max: agg.max,
        })
    }

    pub fn summary(&self) -> MetricsSummary {
        let counters = self
            .counters
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauges = self
            .gauges
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let names: Vec<String> = self.timers.read().unwrap().keys().cloned().collect();
        let timings = names
            .into_iter()
            .filter_map(|name| self.get_timing_stats(&name).map(|stats| (name, stats)))
            .collect();

        MetricsSummary {
            run_id: self.run_id,
            timestamp: Utc::now(),
            uptime: self.start_time.elapsed(),
            counters,
            gauges,
            timings,
            peak_memory: self.peak_memory(),
        }
    }
}

/// Timing statistics for a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub sum: Duration,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Complete metrics summary for reporting
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub uptime: Duration,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
    pub timings: HashMap<String, TimingStats>,
    pub peak_memory: u64,
}

/// Periodic progress logging for long loops
pub struct ProgressReporter {
    name: String,
    total: Option<u64>,
    current: AtomicU64,
    start_time: Instant,
    last_report: RwLock<Instant>,
    report_interval: Duration,
}

impl ProgressReporter {
    pub fn new(name: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            name: name.into(),
            total,
            current: AtomicU64::new(0),
            start_time: Instant::now(),
            last_report: RwLock::new(Instant::now()),
            report_interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn set(&self, current: u64) {
        self.current.store(current, Ordering::Relaxed);
        self.maybe_report();
    }

    pub fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
        self.maybe_report();
    }

    /// Force a progress report
    pub fn report(&self) {
        let current = self.current();
        let elapsed = self.start_time.elapsed();
        let rate = current as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

        match self.total {
            Some(total) if total > 0 => {
                let percentage = (current as f64 / total as f64) * 100.0;
                let eta = (rate > 0.0)
                    .then(|| Duration::from_secs_f64(total.saturating_sub(current) as f64 / rate));
                info!(
                    operation = %self.name,
                    current,
                    total,
                    elapsed = ?elapsed,
                    eta = ?eta,
                    "Progress: {:.1}% ({}/{}) at {:.2}/sec",
                    percentage,
                    current,
                    total,
                    rate
                );
            }
            _ => {
                info!(
                    operation = %self.name,
                    current,
                    elapsed = ?elapsed,
                    "Progress: {} at {:.2}/sec",
                    current,
                    rate
                );
            }
        }

        *self.last_report.write().unwrap() = Instant::now();
    }

    fn maybe_report(&self) {
        let now = Instant::now();
        let due = now.duration_since(*self.last_report.read().unwrap()) >= self.report_interval;
        if due {
            self.report();
        }
    }
}

/// Installed subscriber plus the shared metrics collector
pub struct LoggingSystem {
    metrics: Arc<MetricsCollector>,
    _guards: Vec<WorkerGuard>,
}

impl LoggingSystem {
    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let mut guards = Vec::new();

        let writer = if let Some(log_dir) = &config.log_dir {
            fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, &config.log_file_pattern);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            guards.push(guard);
            non_blocking
        } else {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            guards.push(guard);
            non_blocking
        };

        let format_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
            fmt::layer()
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .with_writer(writer)
                .boxed()
        } else {
            fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .with_ansi(config.log_dir.is_none())
                .with_writer(writer)
                .boxed()
        };

        let mut env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
        for (module, level) in &config.module_levels {
            let directive = format!("{}={}", module, level.as_str())
                .parse::<Directive>()
                .map_err(|e| KmxError::config(format!("Invalid log directive for '{}': {}", module, e)))?;
            env_filter = env_filter.add_directive(directive);
        }

        tracing_subscriber::registry()
            .with(format_layer.with_filter(env_filter))
            .try_init()
            .map_err(|e| KmxError::config(format!("Failed to initialize logging: {}", e)))?;

        info!(config = ?config, "KMX logging initialized");

        Ok(Self {
            metrics: Arc::new(MetricsCollector::new()),
            _guards: guards,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn log_metrics_summary(&self) {
        let summary = self.metrics.summary();
        info!(metrics = ?summary, "Metrics summary");
    }
}

/// Run `f`, recording its duration under `name`
pub fn time_operation<T, F>(metrics: Option<&MetricsCollector>, name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = f();
    let duration = start.elapsed();

    if let Some(metrics) = metrics {
        metrics.record_time(name, duration);
    }
    debug!(operation = name, duration = ?duration, "Operation completed");
    result
}
