//! Rules: one compiled pattern plus its cycle worker.
//!
//! Each rule runs a worker thread that consumes lines from a bounded input
//! queue and, on its own cycle timer, emits exactly one `MetricSample` into
//! the output queue it was given. Emission is unconditional: a cycle with no
//! matching (or no) lines still produces a zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::desired::{metric_name, MonitorSpec};
use crate::error::{LogmonResult, ValidationError};
use crate::shutdown::Shutdown;
use crate::worker::{join_worker, spawn_worker};

use super::matcher::{Accumulator, Aggregation, LineMatcher};

/// Descriptor of a rule to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique name within a group, `log.monitor--------<tag>`.
    pub name: String,
    /// Pattern to compile.
    pub pattern: String,
    /// Emission period.
    pub cycle: Duration,
    /// Aggregation applied at each cycle boundary.
    pub aggregation: Aggregation,
    /// Tag carried on every sample.
    pub tag: String,
}

impl RuleSpec {
    /// Rule descriptor for a desired monitor spec.
    #[must_use]
    pub fn from_monitor_spec(spec: &MonitorSpec, cycle: Duration, aggregation: Aggregation) -> Self {
        Self {
            name: spec.metric_name(),
            pattern: spec.compiled_pattern(),
            cycle,
            aggregation,
            tag: spec.tag.clone(),
        }
    }

    /// Rule descriptor named after `tag`.
    #[must_use]
    pub fn new(pattern: impl Into<String>, tag: impl Into<String>, cycle: Duration) -> Self {
        let tag = tag.into();
        Self {
            name: metric_name(&tag),
            pattern: pattern.into(),
            cycle,
            aggregation: Aggregation::Sum,
            tag,
        }
    }

    /// Sets the aggregation.
    #[must_use]
    pub const fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Checks the descriptor without starting anything.
    ///
    /// # Errors
    ///
    /// Fails on a zero cycle or a pattern that does not compile.
    pub fn validate(&self) -> Result<LineMatcher, ValidationError> {
        if self.cycle.is_zero() {
            return Err(ValidationError::ZeroDuration {
                field: "cycle".to_string(),
            });
        }
        LineMatcher::new(&self.pattern)
    }
}

/// One value emitted by a rule for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Rule name.
    pub name: String,
    /// Aggregated value.
    pub value: f64,
    /// Rule tag.
    pub tag: String,
    /// Cycle length in seconds.
    pub cycle_secs: u64,
}

/// A running rule.
#[derive(Debug)]
pub struct Rule {
    name: String,
    tag: String,
    cycle: Duration,
    aggregation: Aggregation,
    input: Sender<Arc<str>>,
    shutdown: Shutdown,
    stopped: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Rule {
    /// Compiles the pattern and starts the cycle worker.
    ///
    /// Samples are sent to `output`. Compilation happens before anything is
    /// allocated, so a bad pattern leaves nothing behind.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad descriptor, or a spawn error.
    pub fn start(spec: &RuleSpec, input_capacity: usize, output: Sender<MetricSample>) -> LogmonResult<Self> {
        let matcher = spec.validate()?;
        let (input, lines) = bounded::<Arc<str>>(input_capacity.max(1));
        let shutdown = Shutdown::new();

        let worker = CycleWorker {
            matcher,
            accumulator: Accumulator::new(spec.aggregation),
            template: MetricSample {
                name: spec.name.clone(),
                value: 0.0,
                tag: spec.tag.clone(),
                cycle_secs: spec.cycle.as_secs(),
            },
            lines,
            output,
            shutdown: shutdown.clone(),
        };
        let cycle = spec.cycle;
        let handle = spawn_worker(format!("logmon-rule-{}", short_name(&spec.name)), move || {
            worker.run(cycle);
        })?;

        Ok(Self {
            name: spec.name.clone(),
            tag: spec.tag.clone(),
            cycle: spec.cycle,
            aggregation: spec.aggregation,
            input,
            shutdown,
            stopped: AtomicBool::new(false),
            join: Mutex::new(Some(handle)),
        })
    }

    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rule tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Emission period.
    #[must_use]
    pub const fn cycle(&self) -> Duration {
        self.cycle
    }

    /// Aggregation kind.
    #[must_use]
    pub const fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Input queue for lines.
    #[must_use]
    pub fn input(&self) -> &Sender<Arc<str>> {
        &self.input
    }

    /// Whether `stop` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the worker. Senders blocked on the input queue are released with
    /// a disconnected error. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.trigger();
        join_worker(&self.join);
        tracing::debug!(rule = %self.name, "rule stopped");
    }
}

impl Drop for Rule {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CycleWorker {
    matcher: LineMatcher,
    accumulator: Accumulator,
    template: MetricSample,
    lines: Receiver<Arc<str>>,
    output: Sender<MetricSample>,
    shutdown: Shutdown,
}

impl CycleWorker {
    fn run(self, cycle: Duration) {
        let Self {
            matcher,
            mut accumulator,
            template,
            lines,
            output,
            shutdown,
        } = self;
        let stop = shutdown.signal().clone();
        let ticker = tick(cycle);
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(lines) -> line => match line {
                    Ok(line) => accumulator.observe(&matcher, &line),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    let sample = MetricSample {
                        value: accumulator.flush(),
                        ..template.clone()
                    };
                    // Blocks while the consumer is behind, but never past a stop.
                    let delivered = select! {
                        send(output, sample) -> res => res.is_ok(),
                        recv(stop) -> _ => false,
                    };
                    if !delivered {
                        break;
                    }
                }
            }
        }
    }
}

/// Thread names are capped by some platforms; keep the distinctive tail.
fn short_name(name: &str) -> &str {
    let tag = name.rsplit("keywords=").next().unwrap_or(name);
    let start = tag
        .char_indices()
        .rev()
        .nth(15)
        .map_or(0, |(idx, _)| idx);
    &tag[start..]
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    fn spec(pattern: &str, cycle_ms: u64) -> RuleSpec {
        RuleSpec::new(pattern, format!("filepath=/t.log,keywords={pattern}"), Duration::from_millis(cycle_ms))
    }

    #[test]
    fn test_rule_emits_zero_without_lines() {
        let (tx, rx) = bounded(64);
        let rule = Rule::start(&spec("ERROR", 50), 16, tx).unwrap();

        let started = Instant::now();
        let mut samples = Vec::new();
        while started.elapsed() < Duration::from_millis(530) {
            if let Ok(sample) = rx.recv_timeout(Duration::from_millis(20)) {
                samples.push(sample);
            }
        }
        rule.stop();

        // floor(530 / 50) = 10, with slack for scheduling jitter.
        assert!(
            (8..=11).contains(&samples.len()),
            "expected ~10 samples, got {}",
            samples.len()
        );
        assert!(samples.iter().all(|s| s.value == 0.0));
        assert!(samples.iter().all(|s| s.name == rule.name()));
    }

    #[test]
    fn test_rule_counts_matching_lines_in_one_cycle() {
        let (tx, rx) = bounded(64);
        let rule = Rule::start(&spec("ERROR", 300), 16, tx).unwrap();

        for line in ["ERROR one", "INFO two", "ERROR three", "ERROR four"] {
            rule.input().send(Arc::from(line)).unwrap();
        }

        let sample = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(sample.value, 3.0);
        assert_eq!(sample.tag, "filepath=/t.log,keywords=ERROR");

        let next = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(next.value, 0.0);
    }

    #[test]
    fn test_invalid_pattern_fails_at_creation() {
        let (tx, _rx) = bounded(1);
        let err = Rule::start(&spec("(bad", 50), 16, tx).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_zero_cycle_is_rejected() {
        let (tx, _rx) = bounded(1);
        let err = Rule::start(&spec("ok", 0), 16, tx).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_stop_releases_blocked_sender() {
        let (tx, _rx) = bounded(1);
        // Long cycle: the worker only consumes lines; fill the queue faster than
        // it drains by stopping first, then check sends fail instead of blocking.
        let rule = Arc::new(Rule::start(&spec("x", 60_000), 1, tx).unwrap());
        rule.stop();
        rule.stop();
        assert!(rule.is_stopped());

        let sender = rule.input().clone();
        let handle = thread::spawn(move || {
            let mut failures = 0;
            for _ in 0..4 {
                if sender.send(Arc::from("x")).is_err() {
                    failures += 1;
                }
            }
            failures
        });
        assert_eq!(handle.join().unwrap(), 4);
    }

    #[test]
    fn test_short_name_keeps_tail() {
        assert_eq!(short_name("log.monitor--------filepath=/a,keywords=ERR"), "ERR");
        let long = "log.monitor--------filepath=/a,keywords=abcdefghijklmnopqrstuvwxyz";
        assert_eq!(short_name(long).chars().count(), 16);
    }
}
