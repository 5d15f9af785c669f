//! Sinks receiving published batches.
//!
//! A `FileMonitor` publishes its merged samples once per publish tick to each
//! of its sinks. Sinks are the boundary to the reporting collaborator.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{ExecutionError, LogmonResult};

use super::rule::MetricSample;

/// Samples keyed by rule name.
pub type MetricBatch = BTreeMap<String, MetricSample>;

/// Consumer of published batches.
pub trait Sink: Send + Sync + Debug {
    /// Prepares the sink. Called once before the first `send`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; a failing sink aborts monitor creation.
    fn init(&self) -> LogmonResult<()> {
        Ok(())
    }

    /// Delivers one batch. Called at most once per publish tick.
    ///
    /// # Errors
    ///
    /// Implementation-defined; errors are logged by the publisher.
    fn send(&self, batch: &MetricBatch) -> LogmonResult<()>;

    /// The most recently delivered batch.
    fn last_batch(&self) -> MetricBatch;

    /// Releases the sink. Idempotent.
    fn stop(&self) {}
}

/// Keeps the last delivered batch in memory.
#[derive(Debug, Default)]
pub struct LatestBatchSink {
    batch: RwLock<MetricBatch>,
    stopped: AtomicBool,
}

impl LatestBatchSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `stop` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Sink for LatestBatchSink {
    fn init(&self) -> LogmonResult<()> {
        self.batch.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn send(&self, batch: &MetricBatch) -> LogmonResult<()> {
        if self.is_stopped() {
            return Ok(());
        }
        *self.batch.write().unwrap_or_else(PoisonError::into_inner) = batch.clone();
        Ok(())
    }

    fn last_batch(&self) -> MetricBatch {
        self.batch.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Forwards batches over a bounded channel without ever blocking the
/// publisher; batches that do not fit are counted and dropped. Sending after
/// the receiver is gone is reported as a sink error.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<MetricBatch>,
    last: RwLock<MetricBatch>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Creates the sink and the receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<MetricBatch>) {
        let (tx, rx) = bounded(capacity.max(1));
        let sink = Self {
            tx,
            last: RwLock::new(MetricBatch::new()),
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Batches dropped because the receiver was full or gone.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Sink for ChannelSink {
    fn send(&self, batch: &MetricBatch) -> LogmonResult<()> {
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = batch.clone();
        match self.tx.try_send(batch.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ExecutionError::Sink {
                    sink: "channel".to_string(),
                    message: "receiver disconnected".to_string(),
                }
                .into())
            }
        }
    }

    fn last_batch(&self) -> MetricBatch {
        self.last.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Creates the sinks for a newly started monitor of `path`.
pub trait SinkFactory: Send + Sync {
    /// Sinks for one monitor.
    ///
    /// # Errors
    ///
    /// Implementation-defined; a failure skips the monitor being created.
    fn create(&self, path: &Path) -> LogmonResult<Vec<Arc<dyn Sink>>>;
}

impl<F> SinkFactory for F
where
    F: Fn(&Path) -> LogmonResult<Vec<Arc<dyn Sink>>> + Send + Sync,
{
    fn create(&self, path: &Path) -> LogmonResult<Vec<Arc<dyn Sink>>> {
        self(path)
    }
}

/// One `LatestBatchSink` per monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestBatchSinks;

impl SinkFactory for LatestBatchSinks {
    fn create(&self, _path: &Path) -> LogmonResult<Vec<Arc<dyn Sink>>> {
        Ok(vec![Arc::new(LatestBatchSink::new())])
    }
}

#[cfg(test)]
mod tests {
    use crate::error::LogmonError;

    use super::*;

    fn batch(value: f64) -> MetricBatch {
        let mut b = MetricBatch::new();
        b.insert(
            "log.monitor--------t".to_string(),
            MetricSample {
                name: "log.monitor--------t".to_string(),
                value,
                tag: "t".to_string(),
                cycle_secs: 60,
            },
        );
        b
    }

    #[test]
    fn test_latest_batch_sink_keeps_last() {
        let sink = LatestBatchSink::new();
        sink.init().unwrap();
        assert!(sink.last_batch().is_empty());

        sink.send(&batch(1.0)).unwrap();
        sink.send(&batch(2.0)).unwrap();
        assert_eq!(sink.last_batch()["log.monitor--------t"].value, 2.0);
    }

    #[test]
    fn test_latest_batch_sink_ignores_sends_after_stop() {
        let sink = LatestBatchSink::new();
        sink.send(&batch(1.0)).unwrap();
        sink.stop();
        sink.stop();
        sink.send(&batch(5.0)).unwrap();
        assert_eq!(sink.last_batch()["log.monitor--------t"].value, 1.0);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::channel(1);
        sink.send(&batch(1.0)).unwrap();
        sink.send(&batch(2.0)).unwrap();
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap()["log.monitor--------t"].value, 1.0);
        assert_eq!(sink.last_batch()["log.monitor--------t"].value, 2.0);
    }

    #[test]
    fn test_channel_sink_reports_gone_receiver() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        let err = sink.send(&batch(1.0)).unwrap_err();
        assert!(matches!(err, LogmonError::Execution(ExecutionError::Sink { .. })));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(sink.last_batch()["log.monitor--------t"].value, 1.0);
    }

    #[test]
    fn test_closure_sink_factory() {
        let factory = |_: &Path| -> LogmonResult<Vec<Arc<dyn Sink>>> {
            Ok(vec![Arc::new(LatestBatchSink::new()), Arc::new(ChannelSink::channel(4).0)])
        };
        assert_eq!(factory.create(Path::new("/x.log")).unwrap().len(), 2);
        assert_eq!(LatestBatchSinks.create(Path::new("/x.log")).unwrap().len(), 1);
    }
}
