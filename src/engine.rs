//! The embeddable engine.
//!
//! `LogMonitorEngine` wires desired-spec intake, reconciliation, the stale
//! sweep and metric export together. It can be driven by hand (`refresh`,
//! `sweep`, `collect`) or run its own periodic tasks against a `SpecSource`
//! via `start`.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::desired::{parse_batch, split_metric_name};
use crate::error::LogmonResult;
use crate::monitor::{FileMonitor, LatestBatchSinks, SinkFactory};
use crate::reconcile::{ActiveRegistry, LivenessRegistry, ReconcileReport, Reconciler};
use crate::time::{Clock, SystemClock};
use crate::worker::PeriodicTask;

/// Counter type reported for every exported value.
pub const COUNTER_TYPE_GAUGE: &str = "GAUGE";

/// Supplier of the desired tag strings.
pub trait SpecSource: Send + Sync + Debug {
    /// Current desired tags, `filepath=<path>,keywords=<pattern>` each.
    ///
    /// # Errors
    ///
    /// Implementation-defined; a failed fetch skips that refresh.
    fn fetch(&self) -> LogmonResult<Vec<String>>;
}

/// A spec source holding a replaceable in-memory list.
#[derive(Debug, Default)]
pub struct StaticSpecSource {
    tags: RwLock<Vec<String>>,
}

impl StaticSpecSource {
    /// Source returning `tags` until replaced.
    #[must_use]
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: RwLock::new(tags.into_iter().map(Into::into).collect()),
        }
    }

    /// Swaps the desired tags.
    pub fn replace<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.tags.write().unwrap_or_else(PoisonError::into_inner) = tags.into_iter().map(Into::into).collect();
    }
}

impl SpecSource for StaticSpecSource {
    fn fetch(&self) -> LogmonResult<Vec<String>> {
        Ok(self.tags.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// One value at the export boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedMetric {
    /// Metric name, always `log.monitor`.
    pub metric: String,
    /// Last published value.
    pub value: f64,
    /// The monitor tag.
    pub tags: String,
    /// Always `GAUGE`.
    pub counter_type: String,
    /// Rule cycle in seconds.
    pub step_secs: u64,
    /// Collection time, unix seconds.
    pub timestamp: i64,
}

/// Builder for `LogMonitorEngine`.
pub struct LogMonitorEngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sinks: Arc<dyn SinkFactory>,
}

impl LogMonitorEngineBuilder {
    /// Uses `clock` for liveness timestamps and export times.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses `sinks` to create each monitor's sinks.
    #[must_use]
    pub fn sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Validation errors from the configuration.
    pub fn build(self) -> LogmonResult<LogMonitorEngine> {
        self.config.validate()?;
        let reconciler = Reconciler::with_parts(
            self.config.reconciler.clone(),
            self.config.monitor.clone(),
            Arc::clone(&self.clock),
            self.sinks,
        );
        Ok(LogMonitorEngine {
            config: self.config,
            reconciler: Arc::new(reconciler),
            clock: self.clock,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Dynamic log-pattern monitoring engine.
#[derive(Debug)]
pub struct LogMonitorEngine {
    config: EngineConfig,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl LogMonitorEngine {
    /// Engine on the system clock with in-memory sinks.
    ///
    /// # Errors
    ///
    /// Validation errors from the configuration.
    pub fn new(config: EngineConfig) -> LogmonResult<Self> {
        Self::builder(config).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(config: EngineConfig) -> LogMonitorEngineBuilder {
        LogMonitorEngineBuilder {
            config,
            clock: Arc::new(SystemClock),
            sinks: Arc::new(LatestBatchSinks),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Active-monitor registry.
    #[must_use]
    pub fn active(&self) -> &Arc<ActiveRegistry> {
        self.reconciler.active()
    }

    /// Liveness registry.
    #[must_use]
    pub fn liveness(&self) -> &Arc<LivenessRegistry> {
        self.reconciler.liveness()
    }

    /// Parses `tags` and runs one reconciliation pass.
    ///
    /// Unparseable tags are reported under their position in `tags`.
    pub fn refresh<S: AsRef<str>>(&self, tags: &[S]) -> ReconcileReport {
        refresh_with(&self.reconciler, tags)
    }

    /// Fetches from `source` and runs one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Whatever the source reports.
    pub fn refresh_from(&self, source: &dyn SpecSource) -> LogmonResult<ReconcileReport> {
        let tags = source.fetch()?;
        Ok(self.refresh(tags.as_slice()))
    }

    /// Runs one stale sweep.
    ///
    /// # Errors
    ///
    /// Only on a poisoned registry lock.
    pub fn sweep(&self) -> LogmonResult<Vec<std::path::PathBuf>> {
        self.reconciler.sweep()
    }

    /// The monitor currently serving `path`.
    ///
    /// # Errors
    ///
    /// Only on a poisoned registry lock.
    pub fn monitor_for(&self, path: &std::path::Path) -> LogmonResult<Option<Arc<FileMonitor>>> {
        self.active().monitor_for(path)
    }

    /// Every published value of every live monitor.
    ///
    /// # Errors
    ///
    /// Only on a poisoned registry lock.
    pub fn collect(&self) -> LogmonResult<Vec<ExportedMetric>> {
        let timestamp = self.clock.now().timestamp();
        let mut out = Vec::new();
        for monitor in self.active().monitors()? {
            for (name, sample) in monitor.results() {
                let (metric, tag) = split_metric_name(&name);
                out.push(ExportedMetric {
                    metric: metric.to_string(),
                    value: sample.value,
                    tags: tag.to_string(),
                    counter_type: COUNTER_TYPE_GAUGE.to_string(),
                    step_secs: sample.cycle_secs,
                    timestamp,
                });
            }
        }
        Ok(out)
    }

    /// Refreshes from `source` once, then keeps refreshing and sweeping on
    /// the configured intervals until `shutdown`.
    ///
    /// # Errors
    ///
    /// Spawn errors. A failing initial fetch is logged, not returned.
    pub fn start(&self, source: Arc<dyn SpecSource>) -> LogmonResult<()> {
        run_refresh(&self.reconciler, source.as_ref());

        let reconciler = Arc::clone(&self.reconciler);
        let refresher = PeriodicTask::spawn("logmon-refresh", self.config.reconciler.refresh_interval(), move || {
            run_refresh(&reconciler, source.as_ref());
        })?;
        let sweeper = self.reconciler.spawn_sweeper()?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(refresher);
        tasks.push(sweeper);
        tracing::info!("log monitor engine started");
        Ok(())
    }

    /// Stops the periodic tasks and every monitor. Idempotent.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.stop();
        }
        match self.reconciler.stop_all() {
            Ok(0) => {}
            Ok(stopped) => tracing::info!(monitors = stopped, "log monitor engine shut down"),
            Err(e) => tracing::error!(error = %e, "failed to stop monitors"),
        }
    }
}

impl Drop for LogMonitorEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn refresh_with<S: AsRef<str>>(reconciler: &Reconciler, tags: &[S]) -> ReconcileReport {
    let ids: Vec<String> = (0..tags.len()).map(|i| i.to_string()).collect();
    let parsed = parse_batch(ids.iter().map(String::as_str).zip(tags.iter().map(|t| t.as_ref())));
    for (id, err) in &parsed.rejected {
        tracing::warn!(entry = %id, error = %err, "rejecting malformed monitor tag");
    }
    let mut report = reconciler.reconcile(&parsed.specs);
    report.rejected = parsed.rejected.into_iter().collect();
    report
}

fn run_refresh(reconciler: &Reconciler, source: &dyn SpecSource) {
    match source.fetch() {
        Ok(tags) => {
            let report = refresh_with(reconciler, tags.as_slice());
            tracing::debug!(
                created = report.created.len(),
                consolidated = report.consolidated.len(),
                refreshed = report.refreshed,
                failed = report.failed.len(),
                rejected = report.rejected.len(),
                "refresh pass complete"
            );
        }
        Err(e) => tracing::warn!(error = %e, "failed to fetch monitor specs"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;

    fn engine() -> LogMonitorEngine {
        let config = EngineConfig::from_json_str(
            r#"{ "reconciler": { "cycle_ms": 100, "refresh_interval_ms": 20, "sweep_interval_ms": 20 },
                 "monitor": { "publish_interval_ms": 20, "line_source": { "poll_interval_ms": 10 } } }"#,
        )
        .unwrap();
        LogMonitorEngine::new(config).unwrap()
    }

    fn tag(path: &Path, pattern: &str) -> String {
        format!("filepath={},keywords={pattern}", path.display())
    }

    #[test]
    fn test_static_spec_source_replace() {
        let source = StaticSpecSource::new(["a"]);
        assert_eq!(source.fetch().unwrap(), vec!["a".to_string()]);
        source.replace(Vec::<String>::new());
        assert!(source.fetch().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_reports_rejects() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let report = engine.refresh(&[tag(&dir.path().join("a.log"), "ERROR"), "nonsense".to_string()]);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "1");
        assert!(!report.is_clean());
    }

    #[test]
    fn test_start_drives_refreshes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let engine = engine();
        let source = Arc::new(StaticSpecSource::new([tag(&path, "A")]));
        engine.start(Arc::clone(&source) as Arc<dyn SpecSource>).unwrap();
        assert!(engine.active().is_tracked(&path).unwrap());

        source.replace([tag(&path, "A"), tag(&path, "B")]);
        let started = std::time::Instant::now();
        while engine.active().patterns_for(&path).unwrap().len() < 2 {
            assert!(started.elapsed() < std::time::Duration::from_secs(3), "refresh task never ran");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        engine.shutdown();
        engine.shutdown();
        assert!(engine.active().files().unwrap().is_empty());
    }
}
