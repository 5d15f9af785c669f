//! Per-file monitoring pipeline.
//!
//! A `FileMonitor` tails one file through a `LineSource`, fans every line out
//! to the rules of its `RuleGroup`, and merges their periodic emissions into
//! batches published to `Sink`s. Everything runs on named threads connected
//! by bounded crossbeam channels; full queues block the producer instead of
//! dropping data.

/// The per-file monitor and its workers.
pub mod file_monitor;
/// Mutable rule sets and line dispatch.
pub mod group;
/// Pattern compilation and per-cycle aggregation.
pub mod matcher;
/// Rules and their cycle workers.
pub mod rule;
/// Publish targets.
pub mod sink;
/// Follow-by-name file tailing.
pub mod source;

pub use file_monitor::{FileMonitor, FileMonitorConfig, MonitorId};
pub use group::{Dispatch, RuleGroup};
pub use matcher::{Aggregation, LineMatcher, VALUE_GROUP};
pub use rule::{MetricSample, Rule, RuleSpec};
pub use sink::{ChannelSink, LatestBatchSink, LatestBatchSinks, MetricBatch, Sink, SinkFactory};
pub use source::{LineSource, LineSourceConfig};
