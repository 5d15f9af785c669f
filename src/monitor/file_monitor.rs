//! File monitors.
//!
//! A `FileMonitor` owns one `LineSource` and one `RuleGroup` for a single
//! path and runs two workers:
//!
//! - fan-out: takes each line from the source and hands it to every current
//!   rule, blocking on a full rule queue rather than dropping the line.
//! - aggregation: merges rule emissions by name and, on every publish tick
//!   that saw new data, publishes the batch to the sinks and copies it into
//!   the result table read by `get_value` / `results`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, LogmonResult, ValidationError};
use crate::shutdown::Shutdown;
use crate::worker::{join_worker, spawn_worker};

use super::group::{dispatch_to, Dispatch, RuleGroup};
use super::rule::{MetricSample, Rule, RuleSpec};
use super::sink::{MetricBatch, Sink};
use super::source::{LineSource, LineSourceConfig};

/// Per-monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMonitorConfig {
    /// Publish tick; bounds how stale the result table can get.
    pub publish_interval_ms: u64,
    /// Capacity of the queue rules emit into.
    pub merge_queue_capacity: usize,
    /// Capacity of each rule's line queue.
    pub rule_queue_capacity: usize,
    /// Line source settings.
    pub line_source: LineSourceConfig,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 1_000,
            merge_queue_capacity: 128,
            rule_queue_capacity: 1_024,
            line_source: LineSourceConfig::default(),
        }
    }
}

impl FileMonitorConfig {
    /// Publish tick as a `Duration`.
    #[must_use]
    pub const fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    /// Rejects zero ticks and zero capacities.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.publish_interval_ms == 0 {
            return Err(ValidationError::ZeroDuration {
                field: "monitor.publish_interval_ms".to_string(),
            });
        }
        for (field, value) in [
            ("monitor.merge_queue_capacity", self.merge_queue_capacity),
            ("monitor.rule_queue_capacity", self.rule_queue_capacity),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroCapacity {
                    field: field.to_string(),
                });
            }
        }
        self.line_source.validate()
    }
}

/// Identity of one monitor instance. A consolidated replacement for the same
/// path gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorId(Uuid);

impl MonitorId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tailer plus its rules for a single file.
#[derive(Debug)]
pub struct FileMonitor {
    id: MonitorId,
    path: PathBuf,
    group: Arc<RuleGroup>,
    source: Arc<LineSource>,
    sinks: Arc<[Arc<dyn Sink>]>,
    results: Arc<RwLock<MetricBatch>>,
    shutdown: Shutdown,
    stopped: AtomicBool,
    fan_out: Mutex<Option<JoinHandle<()>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
}

impl FileMonitor {
    /// Starts monitoring `path` with the given initial rules.
    ///
    /// Every rule is validated before anything is opened, so a bad pattern
    /// fails the whole call with no tailer or worker left running. Rules
    /// repeating an earlier name are ignored.
    ///
    /// # Errors
    ///
    /// Validation errors for the config or any rule, sink `init` errors, and
    /// spawn errors.
    pub fn start(
        path: impl Into<PathBuf>,
        rules: &[RuleSpec],
        sinks: Vec<Arc<dyn Sink>>,
        config: &FileMonitorConfig,
    ) -> LogmonResult<Self> {
        let path = path.into();
        config.validate()?;
        for rule in rules {
            rule.validate()?;
        }

        // Dropping `group` or `source` on an early return stops them.
        let (merge_tx, merge_rx) = bounded::<MetricSample>(config.merge_queue_capacity);
        let group = Arc::new(RuleGroup::new(config.rule_queue_capacity, merge_tx));
        for rule in rules {
            if !group.contains(&rule.name) {
                group.add(rule)?;
            }
        }
        let source = Arc::new(LineSource::open(&path, &config.line_source)?);
        init_sinks(&sinks)?;

        let monitor = Self {
            id: MonitorId::new(),
            path,
            group,
            source,
            sinks: sinks.into(),
            results: Arc::new(RwLock::new(MetricBatch::new())),
            shutdown: Shutdown::new(),
            stopped: AtomicBool::new(false),
            fan_out: Mutex::new(None),
            aggregator: Mutex::new(None),
        };
        // On a spawn failure `monitor` is dropped here, which stops whatever
        // already started.
        monitor.spawn_workers(merge_rx, config.publish_interval())?;

        tracing::info!(
            monitor = %monitor.id,
            path = %monitor.path.display(),
            rules = monitor.group.len(),
            "file monitor started"
        );
        Ok(monitor)
    }

    fn spawn_workers(&self, merge_rx: Receiver<MetricSample>, publish_interval: Duration) -> LogmonResult<()> {
        let label = short_id(self.id);

        let fan_out = FanOut {
            source: Arc::clone(&self.source),
            group: Arc::clone(&self.group),
            shutdown: self.shutdown.clone(),
        };
        let handle = spawn_worker(format!("logmon-fanout-{label}"), move || fan_out.run())?;
        *self.fan_out.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let aggregator = Aggregator {
            path: self.path.clone(),
            merge_rx,
            sinks: Arc::clone(&self.sinks),
            results: Arc::clone(&self.results),
            shutdown: self.shutdown.clone(),
        };
        let handle = spawn_worker(format!("logmon-agg-{label}"), move || {
            aggregator.run(publish_interval);
        })?;
        *self.aggregator.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Monitor instance id.
    #[must_use]
    pub const fn id(&self) -> MonitorId {
        self.id
    }

    /// Monitored path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a rule to the running monitor.
    ///
    /// # Errors
    ///
    /// `ExecutionError::MonitorStopped` after `stop`, otherwise whatever
    /// `RuleGroup::add` reports.
    pub fn add_rule(&self, spec: &RuleSpec) -> LogmonResult<Arc<Rule>> {
        if self.is_stopped() {
            return Err(ExecutionError::MonitorStopped {
                path: self.path.display().to_string(),
            }
            .into());
        }
        self.group.add(spec)
    }

    /// Stops and removes a rule, dropping its published value.
    ///
    /// # Errors
    ///
    /// `ExecutionError::RuleNotFound` if no such rule exists.
    pub fn remove_rule(&self, name: &str) -> LogmonResult<()> {
        self.group.remove(name)?;
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    /// Names of the running rules.
    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        self.group.names()
    }

    /// Last published sample for a rule name.
    #[must_use]
    pub fn get_value(&self, name: &str) -> Option<MetricSample> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of the result table.
    #[must_use]
    pub fn results(&self) -> MetricBatch {
        self.results.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether `stop` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops every rule, the tailer, the workers and the sinks. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.trigger();
        let rules = self.group.clear();
        self.source.stop();
        join_worker(&self.fan_out);
        join_worker(&self.aggregator);
        for sink in self.sinks.iter() {
            sink.stop();
        }
        tracing::info!(
            monitor = %self.id,
            path = %self.path.display(),
            rules,
            "file monitor stopped"
        );
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FanOut {
    source: Arc<LineSource>,
    group: Arc<RuleGroup>,
    shutdown: Shutdown,
}

impl FanOut {
    fn run(self) {
        let stop = self.shutdown.signal();
        let mut generation = None;
        let mut rules = Vec::new();
        loop {
            let line = select! {
                recv(stop) -> _ => return,
                recv(self.source.lines()) -> line => match line {
                    Ok(line) => line,
                    Err(_) => return,
                },
            };
            let current = self.group.generation();
            if generation != Some(current) {
                rules = self.group.snapshot();
                generation = Some(current);
            }
            let line: Arc<str> = Arc::from(line);
            if dispatch_to(&rules, &line, stop) == Dispatch::Cancelled {
                return;
            }
        }
    }
}

struct Aggregator {
    path: PathBuf,
    merge_rx: Receiver<MetricSample>,
    sinks: Arc<[Arc<dyn Sink>]>,
    results: Arc<RwLock<MetricBatch>>,
    shutdown: Shutdown,
}

impl Aggregator {
    fn run(self, publish_interval: Duration) {
        let stop = self.shutdown.signal();
        let ticker = tick(publish_interval);
        let mut pending = MetricBatch::new();
        loop {
            select! {
                recv(stop) -> _ => return,
                recv(self.merge_rx) -> sample => match sample {
                    Ok(sample) => merge(&mut pending, sample),
                    Err(_) => return,
                },
                recv(ticker) -> _ => {
                    if !pending.is_empty() && !self.shutdown.is_triggered() {
                        self.publish(&pending);
                        pending.clear();
                    }
                }
            }
        }
    }

    fn publish(&self, batch: &MetricBatch) {
        for sink in self.sinks.iter() {
            if let Err(e) = sink.send(batch) {
                tracing::warn!(path = %self.path.display(), error = %e, "sink rejected batch");
            }
        }
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        for (name, sample) in batch {
            results.insert(name.clone(), sample.clone());
        }
    }
}

/// Initializes every sink, stopping the ones already initialized if a later
/// one fails.
fn init_sinks(sinks: &[Arc<dyn Sink>]) -> LogmonResult<()> {
    for (idx, sink) in sinks.iter().enumerate() {
        if let Err(e) = sink.init() {
            for ready in &sinks[..idx] {
                ready.stop();
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Adds `sample` into the pending batch, summing samples that share a name.
fn merge(pending: &mut MetricBatch, sample: MetricSample) {
    match pending.get_mut(&sample.name) {
        Some(existing) => existing.value += sample.value,
        None => {
            pending.insert(sample.name.clone(), sample);
        }
    }
}

fn short_id(id: MonitorId) -> String {
    id.to_string().chars().take(8).collect()
}
