//! Cooperative cancellation signal.
//!
//! A `Shutdown` wraps a zero-capacity channel whose only sender is dropped
//! when the signal fires. Every blocking point in the pipeline selects on
//! `signal()` next to its real work, so a stopped component wakes blocked
//! senders and receivers instead of leaving them parked forever. Nothing is
//! ever sent on a closed queue: workers observe the stop before their next
//! send attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Debug)]
struct Inner {
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    fired: AtomicBool,
}

/// Shared stop signal. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(tx)),
                signal: rx,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let sender = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        true
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    ///
    /// Meant for `select!`; it never yields a message.
    #[must_use]
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{select, RecvTimeoutError};

    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_signal_blocks_until_triggered() {
        let shutdown = Shutdown::new();
        let err = shutdown
            .signal()
            .recv_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, RecvTimeoutError::Timeout);

        shutdown.trigger();
        let err = shutdown
            .signal()
            .recv_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, RecvTimeoutError::Disconnected);
    }

    #[test]
    fn test_trigger_wakes_blocked_sender() {
        let shutdown = Shutdown::new();
        let (tx, _rx) = bounded::<u32>(1);
        tx.send(1).unwrap();

        let worker_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            select! {
                send(tx, 2) -> _ => false,
                recv(worker_shutdown.signal()) -> _ => true,
            }
        });

        thread::sleep(Duration::from_millis(30));
        shutdown.trigger();
        assert!(handle.join().unwrap());
    }
}
