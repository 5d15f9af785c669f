//! # logmon - dynamic log-pattern monitoring
//!
//! logmon follows log files on a host, matches their lines against
//! dynamically configured patterns, aggregates the matches over fixed cycles
//! and exposes one gauge per (file, pattern) pair.
//!
//! ## Core Concepts
//!
//! - **MonitorSpec**: a desired `(file, pattern)` pair, parsed from a
//!   `filepath=<path>,keywords=<pattern>` tag
//! - **FileMonitor**: one tailer per file fanning lines out to its rules
//! - **Rule**: a compiled pattern emitting a sum or average every cycle,
//!   including zero when nothing matched
//! - **Reconciler**: creates, consolidates and refreshes monitors from each
//!   batch of desired specs; a sweep tears down monitors that stop being
//!   refreshed
//!
//! ## Usage
//!
//! ```rust,no_run
//! use logmon::{EngineConfig, LogMonitorEngine};
//!
//! let engine = LogMonitorEngine::new(EngineConfig::default())?;
//! engine.refresh(&["filepath=/var/log/app.log,keywords=ERROR"]);
//! for metric in engine.collect()? {
//!     println!("{} {} = {}", metric.metric, metric.tags, metric.value);
//! }
//! # Ok::<(), logmon::LogmonError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Foundations
pub mod config;
pub mod desired;
pub mod error;
pub mod shutdown;
pub mod time;
pub mod worker;

// Pipeline and lifecycle
pub mod engine;
pub mod monitor;
pub mod reconcile;

pub use config::EngineConfig;
pub use desired::{metric_name, parse_batch, parse_tag, split_metric_name, MonitorSpec, ParsedBatch};
pub use engine::{ExportedMetric, LogMonitorEngine, LogMonitorEngineBuilder, SpecSource, StaticSpecSource};
pub use error::{ExecutionError, LogmonError, LogmonResult, ValidationError};
pub use monitor::{
    Aggregation, ChannelSink, FileMonitor, FileMonitorConfig, LatestBatchSink, LineMatcher, LineSource,
    LineSourceConfig, MetricBatch, MetricSample, MonitorId, Rule, RuleGroup, RuleSpec, Sink, SinkFactory,
};
pub use reconcile::{ActiveRegistry, LivenessKey, LivenessRegistry, ReconcileReport, Reconciler, ReconcilerConfig};
pub use shutdown::Shutdown;
pub use time::{Clock, ManualClock, SystemClock};
pub use worker::PeriodicTask;
