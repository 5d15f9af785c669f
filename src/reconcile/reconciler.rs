//! Reconciliation of desired specs against live monitors.
//!
//! A pass only ever creates, consolidates or refreshes. Monitors whose specs
//! disappear are torn down later by the stale sweep once their liveness entry
//! has not been refreshed for the staleness threshold.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::desired::MonitorSpec;
use crate::error::{LogmonError, LogmonResult, ValidationError};
use crate::monitor::{Aggregation, FileMonitor, FileMonitorConfig, LatestBatchSinks, RuleSpec, SinkFactory};
use crate::time::{Clock, SystemClock};
use crate::worker::PeriodicTask;

use super::registry::{ActiveRegistry, LivenessRegistry};

/// Reconciler and sweep tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Rule cycle.
    pub cycle_ms: u64,
    /// Aggregation given to every rule.
    pub aggregation: Aggregation,
    /// A monitor unrefreshed for this long is torn down.
    pub staleness_secs: u64,
    /// How often the sweep runs.
    pub sweep_interval_ms: u64,
    /// How often desired specs are fetched when the engine drives refreshes.
    pub refresh_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cycle_ms: 60_000,
            aggregation: Aggregation::Sum,
            staleness_secs: 70,
            sweep_interval_ms: 60_000,
            refresh_interval_ms: 60_000,
        }
    }
}

impl ReconcilerConfig {
    /// Rule cycle as a `Duration`.
    #[must_use]
    pub const fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    /// Staleness threshold on the wall clock.
    #[must_use]
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.staleness_secs).unwrap_or(i64::MAX))
    }

    /// Sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Refresh period.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Rejects zero durations.
    ///
    /// # Errors
    ///
    /// Returns the first zero field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("reconciler.cycle_ms", self.cycle_ms),
            ("reconciler.staleness_secs", self.staleness_secs),
            ("reconciler.sweep_interval_ms", self.sweep_interval_ms),
            ("reconciler.refresh_interval_ms", self.refresh_interval_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroDuration {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// What one pass did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Files that got their first monitor.
    pub created: Vec<PathBuf>,
    /// Files whose monitor was replaced by one covering more patterns.
    pub consolidated: Vec<PathBuf>,
    /// Specs that were already served.
    pub refreshed: usize,
    /// Specs skipped because applying them failed.
    pub failed: Vec<(MonitorSpec, LogmonError)>,
    /// Raw entries that did not parse, by identifier.
    pub rejected: Vec<(String, LogmonError)>,
}

impl ReconcileReport {
    /// Whether every spec was applied.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Consolidated,
    Refreshed,
}

/// Drives monitor lifetimes from desired specs.
pub struct Reconciler {
    active: Arc<ActiveRegistry>,
    liveness: Arc<LivenessRegistry>,
    clock: Arc<dyn Clock>,
    sinks: Arc<dyn SinkFactory>,
    monitor_config: FileMonitorConfig,
    config: ReconcilerConfig,
    pass: Mutex<()>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("active", &self.active)
            .field("liveness", &self.liveness)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler on the system clock with in-memory sinks.
    #[must_use]
    pub fn new(config: ReconcilerConfig, monitor_config: FileMonitorConfig) -> Self {
        Self::with_parts(
            config,
            monitor_config,
            Arc::new(SystemClock),
            Arc::new(LatestBatchSinks),
        )
    }

    /// Reconciler with an explicit clock and sink factory.
    #[must_use]
    pub fn with_parts(
        config: ReconcilerConfig,
        monitor_config: FileMonitorConfig,
        clock: Arc<dyn Clock>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            active: Arc::new(ActiveRegistry::new()),
            liveness: Arc::new(LivenessRegistry::new()),
            clock,
            sinks,
            monitor_config,
            config,
            pass: Mutex::new(()),
        }
    }

    /// Active-monitor registry.
    #[must_use]
    pub fn active(&self) -> &Arc<ActiveRegistry> {
        &self.active
    }

    /// Liveness registry.
    #[must_use]
    pub fn liveness(&self) -> &Arc<LivenessRegistry> {
        &self.liveness
    }

    /// Reconciler settings.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Applies every spec in order. A spec that fails is logged, recorded in
    /// the report and skipped; the rest of the batch still runs.
    pub fn reconcile(&self, specs: &[MonitorSpec]) -> ReconcileReport {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let mut report = ReconcileReport::default();
        for spec in specs {
            match self.apply(spec, now) {
                Ok(Applied::Created) => report.created.push(spec.file_path.clone()),
                Ok(Applied::Consolidated) => report.consolidated.push(spec.file_path.clone()),
                Ok(Applied::Refreshed) => report.refreshed += 1,
                Err(e) => {
                    tracing::warn!(tag = %spec.tag, error = %e, "skipping monitor spec");
                    report.failed.push((spec.clone(), e));
                }
            }
        }
        report
    }

    fn rule_for(&self, spec: &MonitorSpec) -> RuleSpec {
        RuleSpec::from_monitor_spec(spec, self.config.cycle(), self.config.aggregation)
    }

    fn launch(&self, path: &Path, specs: &[MonitorSpec]) -> LogmonResult<Arc<FileMonitor>> {
        let rules: Vec<RuleSpec> = specs.iter().map(|s| self.rule_for(s)).collect();
        let sinks = self.sinks.create(path)?;
        Ok(Arc::new(FileMonitor::start(path, &rules, sinks, &self.monitor_config)?))
    }

    fn apply(&self, spec: &MonitorSpec, now: DateTime<Utc>) -> LogmonResult<Applied> {
        let path = spec.file_path.as_path();

        if !self.active.is_tracked(path)? {
            let monitor = self.launch(path, std::slice::from_ref(spec))?;
            self.active.insert(spec.clone(), Arc::clone(&monitor))?;
            self.liveness.purge_file(path)?;
            self.liveness.record(path, now, monitor)?;
            return Ok(Applied::Created);
        }

        if self.active.contains(path, &spec.pattern)? {
            if !self.liveness.refresh(path, now)? {
                if let Some(monitor) = self.active.monitor_for(path)? {
                    self.liveness.record(path, now, monitor)?;
                }
            }
            return Ok(Applied::Refreshed);
        }

        // New pattern for a tracked file: one monitor must cover all of them.
        // Compile first so a bad pattern leaves the running monitor alone.
        self.rule_for(spec).validate()?;
        let mut specs = self.active.specs_for(path)?;
        specs.push(spec.clone());

        for old in self.active.monitors_for(path)? {
            old.stop();
        }
        self.liveness.purge_file(path)?;

        let monitor = match self.launch(path, &specs) {
            Ok(monitor) => monitor,
            Err(e) => {
                // The old monitor is gone; let the next pass start over.
                self.active.remove_file(path)?;
                return Err(e);
            }
        };
        self.active.replace_file(path, specs, &monitor)?;
        self.liveness.record(path, now, Arc::clone(&monitor))?;
        tracing::info!(
            path = %path.display(),
            monitor = %monitor.id(),
            patterns = monitor.rule_names().len(),
            "consolidated file monitor"
        );
        Ok(Applied::Consolidated)
    }

    /// Tears down every monitor whose liveness entry is at least the
    /// staleness threshold old. Returns the affected files.
    ///
    /// # Errors
    ///
    /// Only on a poisoned registry lock.
    pub fn sweep(&self) -> LogmonResult<Vec<PathBuf>> {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let mut torn_down = Vec::new();
        for (key, monitor) in self.liveness.stale(now, self.config.staleness())? {
            monitor.stop();
            self.active.remove_monitor(&key.path, monitor.id())?;
            self.liveness.remove(&key)?;
            tracing::info!(
                path = %key.path.display(),
                monitor = %monitor.id(),
                key = %key,
                "stale monitor torn down"
            );
            torn_down.push(key.path);
        }
        Ok(torn_down)
    }

    /// Runs `sweep` every `sweep_interval`.
    ///
    /// # Errors
    ///
    /// Spawn errors.
    pub fn spawn_sweeper(self: &Arc<Self>) -> LogmonResult<PeriodicTask> {
        let reconciler = Arc::clone(self);
        PeriodicTask::spawn("logmon-sweep", self.config.sweep_interval(), move || {
            if let Err(e) = reconciler.sweep() {
                tracing::warn!(error = %e, "stale sweep failed");
            }
        })
    }

    /// Stops every monitor and empties both registries.
    ///
    /// # Errors
    ///
    /// Only on a poisoned registry lock.
    pub fn stop_all(&self) -> LogmonResult<usize> {
        let _pass = self.pass.lock().unwrap_or_else(PoisonError::into_inner);
        let monitors = self.active.drain()?;
        for monitor in &monitors {
            monitor.stop();
        }
        for monitor in self.liveness.purge_all()? {
            monitor.stop();
        }
        Ok(monitors.len())
    }
}
